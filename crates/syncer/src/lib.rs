//! Sqoop syncer: the watch-aggregation / reconcile / report loop.
//!
//! - [`emitter`] merges per-(kind, namespace) watches into snapshots, latest wins.
//! - [`syncer`] processes snapshots one at a time: translate, reconcile, report.
//! - [`reconciler`] converges managed Proxy resources with CAS writes.
//! - [`reporter`] writes per-input acceptance back as status.
//! - [`errs`] fans errors from every task into one logged channel.
//! - [`setup`] wires everything from plain option values.

#![forbid(unsafe_code)]

use sqoop_core::{Kind, ResourceId, StoreError};
use sqoop_engine::TranslateError;
use tokio::sync::mpsc;
use tracing::error;

pub mod emitter;
pub mod errs;
pub mod reconciler;
pub mod reporter;
pub mod setup;
pub mod syncer;

pub use emitter::{EmitterHandle, SnapshotEmitter, SnapshotRx, WatchOpts};
pub use errs::{spawn_error_logger, ErrorAggregator, Tagged};
pub use reconciler::{ProxyReconciler, Reconcile};
pub use reporter::{Report, ReportSummary, StatusReporter};
pub use setup::{run_sqoop, Opts, Settings, SqoopHandle};
pub use syncer::{EndpointSink, GraphQlSyncer, PassReport, SyncerDeps};

/// Everything the loop can surface at runtime. None of these stop the loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("watch {kind} in {namespace}: {source}")]
    Watch { kind: Kind, namespace: String, source: StoreError },
    #[error("translating snapshot {epoch}: {source}")]
    Translate { epoch: u64, source: TranslateError },
    #[error("reconciling proxies: conflict on {id} persisted after {attempts} attempts")]
    ConflictExhausted { id: ResourceId, attempts: u32 },
    #[error("reconciling proxies: {0}")]
    Reconcile(StoreError),
    #[error("writing status for {id}: {source}")]
    Status { id: ResourceId, source: StoreError },
}

/// Send an error to the aggregator; once the aggregator has stopped
/// accepting, log it here instead.
pub(crate) async fn publish(tx: &mpsc::Sender<SyncError>, err: SyncError) {
    if let Err(mpsc::error::SendError(err)) = tx.send(err).await {
        error!(error = %err, "error channel closed; logging directly");
    }
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default)
}
