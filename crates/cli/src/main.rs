use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sqoop_engine::{Engine, EngineConfig, Translator};
use sqoop_store::MemoryStore;
use sqoop_syncer::setup::DEFAULT_WRITE_NAMESPACE;
use sqoop_syncer::{run_sqoop, Opts, Settings, SqoopHandle};
use tokio::signal;
use tracing::{info, warn};

mod seed;

#[derive(Parser, Debug)]
#[command(name = "sqoop", version, about = "Turns GraphQL Schema and ResolverMap resources into a gateway Proxy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Memory,
    Kube,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control loop until Ctrl-C
    Run(RunArgs),
    /// Translate a directory of manifests once and print per-resource acceptance
    Check {
        dir: PathBuf,
        #[arg(long = "write-namespace", default_value = DEFAULT_WRITE_NAMESPACE)]
        write_namespace: String,
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, value_enum, env = "SQOOP_BACKEND", default_value_t = Backend::Memory)]
    backend: Backend,
    /// Namespace the Proxy is written to (default gloo-system)
    #[arg(long, env = "SQOOP_WRITE_NAMESPACE")]
    write_namespace: Option<String>,
    /// Namespaces to watch; repeat or comma-separate
    #[arg(long = "watch-namespace", env = "SQOOP_WATCH_NAMESPACES", value_delimiter = ',')]
    watch_namespaces: Vec<String>,
    #[arg(long, env = "SQOOP_REFRESH_RATE_MS", default_value_t = 1000)]
    refresh_rate_ms: u64,
    /// Router listen address
    #[arg(long, env = "SQOOP_BIND", default_value = "0.0.0.0:9095")]
    bind: SocketAddr,
    #[arg(long)]
    no_router: bool,
    #[arg(long, env = "SQOOP_SIDECAR_ADDR", default_value = "127.0.0.1:9096")]
    sidecar_addr: String,
    /// Seed the memory backend from *.yaml manifests in this directory
    #[arg(long, env = "SQOOP_SEED_DIR")]
    seed_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 3)]
    conflict_retries: u32,
    #[arg(long, default_value_t = 10)]
    shutdown_grace_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("SQOOP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SQOOP_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SQOOP_METRICS_ADDR; expected host:port");
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let write_namespace = args.write_namespace.clone().unwrap_or_else(|| DEFAULT_WRITE_NAMESPACE.to_string());
    let mut settings = Settings {
        write_namespace: args.write_namespace.clone(),
        watch_namespaces: args.watch_namespaces.clone(),
        refresh_rate: Some(Duration::from_millis(args.refresh_rate_ms)),
        bind_addr: (!args.no_router).then_some(args.bind),
        sidecar_addr: Some(args.sidecar_addr.clone()),
        conflict_retries: Some(args.conflict_retries),
    };

    let mut handle: SqoopHandle = match args.backend {
        Backend::Memory => {
            let store = MemoryStore::new();
            if let Some(dir) = &args.seed_dir {
                let resources = seed::load_dir(dir, &write_namespace)?;
                // Without explicit namespaces, watch whatever was seeded.
                if settings.watch_namespaces.is_empty() {
                    for r in &resources {
                        if !settings.watch_namespaces.contains(&r.metadata.namespace) {
                            settings.watch_namespaces.push(r.metadata.namespace.clone());
                        }
                    }
                }
                let n = seed::seed_store(&store, resources).await?;
                info!(count = n, dir = %dir.display(), "memory store seeded");
            }
            run_sqoop(Opts::from_settings(settings), &store).await?
        }
        Backend::Kube => {
            if args.seed_dir.is_some() {
                warn!("--seed-dir only applies to the memory backend; ignoring");
            }
            let factory = sqoop_kubehub::KubeFactory::connect().await?;
            run_sqoop(Opts::from_settings(settings), &factory).await?
        }
    };

    signal::ctrl_c().await.context("listening for Ctrl-C")?;
    info!("Ctrl-C received; shutting down");
    let router = handle.router.take();
    let result = handle.shutdown(Duration::from_secs(args.shutdown_grace_secs)).await;
    if let Some(router) = router {
        router.abort();
    }
    result.map(|_| ())
}

fn check(dir: PathBuf, write_namespace: String, output: Output) -> Result<bool> {
    let resources = seed::load_dir(&dir, &write_namespace)?;
    let snapshot = seed::snapshot_of(resources);
    let engine = Engine::new(EngineConfig::new(write_namespace, "127.0.0.1:9096"));
    let derived = engine.translate(&snapshot)?;
    let ok = derived.rejected().count() == 0;
    match output {
        Output::Human => {
            for a in &derived.acceptance {
                match &a.outcome {
                    sqoop_core::Outcome::Accepted => println!("{:<40} Accepted", a.id.to_string()),
                    sqoop_core::Outcome::Rejected(reason) => println!("{:<40} Rejected: {}", a.id.to_string(), reason),
                }
            }
            println!("{} endpoint(s), {} proxy(ies)", derived.endpoints.len(), derived.proxies.len());
        }
        Output::Json => {
            let rows: Vec<serde_json::Value> = derived
                .acceptance
                .iter()
                .map(|a| {
                    let status = a.outcome.to_status(&engine.config().reporter);
                    serde_json::json!({ "resource": a.id.to_string(), "status": status })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "acceptance": rows, "proxies": derived.proxies }))?);
        }
    }
    Ok(ok)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Check { dir, write_namespace, output } => {
            if !check(dir, write_namespace, output)? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
