//! Bootstrap: resolve options, register kinds, wire and start every task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqoop_core::Kind;
use sqoop_engine::{Engine, EngineConfig};
use sqoop_router::{EndpointTable, Router};
use sqoop_store::{ClientFactory, ResourceClient};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::emitter::{SnapshotEmitter, WatchOpts};
use crate::errs::{spawn_error_logger, ErrorAggregator};
use crate::reconciler::ProxyReconciler;
use crate::reporter::StatusReporter;
use crate::syncer::{GraphQlSyncer, SyncerDeps};

pub const DEFAULT_WRITE_NAMESPACE: &str = "gloo-system";
pub const DEFAULT_SIDECAR_ADDR: &str = "127.0.0.1:9096";

/// Raw settings as they come from flags or a caller. Empty means default.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub write_namespace: Option<String>,
    pub watch_namespaces: Vec<String>,
    pub refresh_rate: Option<Duration>,
    pub bind_addr: Option<SocketAddr>,
    pub sidecar_addr: Option<String>,
    pub conflict_retries: Option<u32>,
}

/// Fully resolved options.
#[derive(Debug, Clone)]
pub struct Opts {
    pub write_namespace: String,
    /// Always contains `write_namespace`.
    pub watch_namespaces: Vec<String>,
    pub watch: WatchOpts,
    /// Router listen address; `None` disables the router.
    pub bind_addr: Option<SocketAddr>,
    pub sidecar_addr: String,
    pub conflict_retries: u32,
}

impl Opts {
    pub fn from_settings(s: Settings) -> Self {
        let write_namespace =
            s.write_namespace.filter(|ns| !ns.is_empty()).unwrap_or_else(|| DEFAULT_WRITE_NAMESPACE.to_string());
        let mut watch_namespaces: Vec<String> = Vec::new();
        for ns in s.watch_namespaces.into_iter().filter(|ns| !ns.is_empty()) {
            if !watch_namespaces.contains(&ns) {
                watch_namespaces.push(ns);
            }
        }
        if !watch_namespaces.contains(&write_namespace) {
            watch_namespaces.push(write_namespace.clone());
        }
        let mut watch = WatchOpts::default();
        if let Some(rate) = s.refresh_rate.filter(|r| !r.is_zero()) {
            watch.refresh_rate = rate;
        }
        Self {
            write_namespace,
            watch_namespaces,
            watch,
            bind_addr: s.bind_addr,
            sidecar_addr: s.sidecar_addr.filter(|a| !a.is_empty()).unwrap_or_else(|| DEFAULT_SIDECAR_ADDR.to_string()),
            conflict_retries: s.conflict_retries.unwrap_or(3),
        }
    }
}

async fn registered(factory: &dyn ClientFactory, kind: Kind) -> Result<Arc<dyn ResourceClient>> {
    let client = factory.client(kind).await.with_context(|| format!("constructing {} client", kind))?;
    client.register().await.with_context(|| format!("registering {}", kind))?;
    Ok(client)
}

/// Handles to a running loop.
pub struct SqoopHandle {
    cancel: CancellationToken,
    errors_cancel: CancellationToken,
    emitter: JoinHandle<()>,
    syncer: JoinHandle<()>,
    aggregator: JoinHandle<()>,
    logger: JoinHandle<usize>,
    endpoints: EndpointTable,
    /// Router task; runs independently of the loop and is not stopped by
    /// [`SqoopHandle::shutdown`].
    pub router: Option<JoinHandle<()>>,
}

impl SqoopHandle {
    pub fn endpoints(&self) -> &EndpointTable { &self.endpoints }

    /// Stop producers first, then the error pipeline, within `grace`.
    /// Returns the number of errors logged over the loop's lifetime.
    pub async fn shutdown(mut self, grace: Duration) -> Result<usize> {
        self.cancel.cancel();
        let stopped = tokio::time::timeout(grace, async {
            let _ = (&mut self.emitter).await;
            let _ = (&mut self.syncer).await;
            self.errors_cancel.cancel();
            let _ = (&mut self.aggregator).await;
            (&mut self.logger).await.unwrap_or(0)
        })
        .await;
        match stopped {
            Ok(logged) => {
                info!(errors_logged = logged, "sqoop stopped");
                Ok(logged)
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "shutdown grace period exceeded; aborting tasks");
                self.emitter.abort();
                self.syncer.abort();
                self.aggregator.abort();
                self.logger.abort();
                anyhow::bail!("shutdown did not complete within {:?}", grace)
            }
        }
    }
}

/// Register every kind, then start the router, the emitter, the event loop
/// and the error pipeline. Any startup failure is returned before anything
/// is spawned.
pub async fn run_sqoop(opts: Opts, factory: &dyn ClientFactory) -> Result<SqoopHandle> {
    let proxies = registered(factory, Kind::Proxy).await?;
    let schemas = registered(factory, Kind::Schema).await?;
    let resolver_maps = registered(factory, Kind::ResolverMap).await?;

    let endpoints = EndpointTable::new();
    let engine = Engine::new(EngineConfig::new(opts.write_namespace.clone(), opts.sidecar_addr.clone()));
    let reporter = StatusReporter::new(engine.config().reporter.clone(), [schemas.clone(), resolver_maps.clone()]);
    let deps = SyncerDeps {
        translator: Arc::new(engine),
        reconciler: Arc::new(ProxyReconciler::new(proxies)),
        reporter: Arc::new(reporter),
        endpoints: Some(Arc::new(endpoints.clone())),
    };
    let syncer = GraphQlSyncer::new(opts.write_namespace.clone(), deps, opts.conflict_retries);

    let router = opts.bind_addr.map(|addr| {
        let router = Router::new(endpoints.clone());
        tokio::spawn(async move {
            if let Err(e) = router.serve(addr).await {
                error!(error = %e, "router stopped");
            }
        })
    });

    let cancel = CancellationToken::new();
    let emitter = SnapshotEmitter::new(vec![schemas, resolver_maps]).start(
        &opts.watch_namespaces,
        opts.watch.clone(),
        cancel.clone(),
    );
    let (sync_err_tx, sync_err_rx) = mpsc::channel(opts.watch.error_capacity.max(1));
    let syncer_task = tokio::spawn(syncer.run(emitter.snapshots, sync_err_tx, cancel.clone()));

    let errors_cancel = CancellationToken::new();
    let (tagged, aggregator) = ErrorAggregator::new()
        .with_capacity(opts.watch.error_capacity)
        .source("emitter", emitter.errors)
        .source("event_loop", sync_err_rx)
        .spawn(errors_cancel.clone());
    let logger = spawn_error_logger(tagged);

    info!(
        write_ns = %opts.write_namespace,
        watch_ns = ?opts.watch_namespaces,
        refresh_ms = opts.watch.refresh_rate.as_millis() as u64,
        router = ?opts.bind_addr,
        "sqoop started"
    );
    Ok(SqoopHandle {
        cancel,
        errors_cancel,
        emitter: emitter.task,
        syncer: syncer_task,
        aggregator,
        logger,
        endpoints,
        router,
    })
}
