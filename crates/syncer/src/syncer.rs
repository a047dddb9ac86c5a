//! Sync orchestrator: consumes snapshots one at a time and runs a full
//! translate / reconcile / report pass on each.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use sqoop_core::{Acceptance, Endpoint, ReconcileResult, Snapshot};
use sqoop_engine::Translator;
use sqoop_router::EndpointTable;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::emitter::SnapshotRx;
use crate::reconciler::Reconcile;
use crate::reporter::Report;
use crate::{publish, SyncError};

/// Receives the endpoint set after every successful translation.
pub trait EndpointSink: Send + Sync {
    fn publish(&self, endpoints: Vec<Endpoint>);
}

impl EndpointSink for EndpointTable {
    fn publish(&self, endpoints: Vec<Endpoint>) { EndpointTable::publish(self, endpoints) }
}

pub struct SyncerDeps {
    pub translator: Arc<dyn Translator>,
    pub reconciler: Arc<dyn Reconcile>,
    pub reporter: Arc<dyn Report>,
    pub endpoints: Option<Arc<dyn EndpointSink>>,
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub epoch: u64,
    pub translated: bool,
    pub reconcile_attempts: u32,
    pub converged: bool,
    pub proxy_writes: usize,
    pub status_writes: usize,
    /// Rejections held back because the snapshot was incomplete.
    pub deferred: usize,
    pub errors: usize,
}

pub struct GraphQlSyncer {
    write_namespace: String,
    deps: SyncerDeps,
    conflict_retries: u32,
}

impl GraphQlSyncer {
    pub fn new(write_namespace: impl Into<String>, deps: SyncerDeps, conflict_retries: u32) -> Self {
        Self { write_namespace: write_namespace.into(), deps, conflict_retries }
    }

    /// One pass over a snapshot. Failures go to `errs`; the pass itself never
    /// fails. Status is reported even when reconciliation did not converge.
    ///
    /// An incomplete snapshot cannot tell a missing input from an unlisted
    /// one, so it neither reconciles proxies nor reports rejections.
    pub async fn sync(&self, snapshot: &Snapshot, errs: &mpsc::Sender<SyncError>) -> PassReport {
        let started = Instant::now();
        counter!("sync_passes_total", 1u64);
        let mut report = PassReport { epoch: snapshot.epoch, ..Default::default() };

        let derived = match self.deps.translator.translate(snapshot) {
            Ok(d) => d,
            Err(source) => {
                warn!(epoch = snapshot.epoch, error = %source, "translation failed; keeping previous output");
                report.errors += 1;
                publish(errs, SyncError::Translate { epoch: snapshot.epoch, source }).await;
                return report;
            }
        };
        report.translated = true;

        if let Some(sink) = &self.deps.endpoints {
            sink.publish(derived.endpoints.clone());
        }

        if !snapshot.is_complete() {
            let accepted: Vec<_> = derived.acceptance.iter().filter(|a| a.outcome.is_accepted()).cloned().collect();
            report.deferred = derived.acceptance.len() - accepted.len();
            info!(
                epoch = snapshot.epoch,
                unsynced = ?snapshot.unsynced,
                deferred = report.deferred,
                "snapshot incomplete; holding proxy writes and rejections"
            );
            self.report_status(&accepted, &mut report, errs).await;
            return report;
        }

        let max_attempts = self.conflict_retries.saturating_add(1);
        loop {
            report.reconcile_attempts += 1;
            match self.deps.reconciler.reconcile(&self.write_namespace, &derived.proxies).await {
                ReconcileResult::Converged(summary) => {
                    report.converged = true;
                    report.proxy_writes += summary.writes();
                    break;
                }
                ReconcileResult::Conflict { id, partial } => {
                    report.proxy_writes += partial.writes();
                    if report.reconcile_attempts < max_attempts {
                        debug!(id = %id, attempt = report.reconcile_attempts, "reconcile conflict; retrying");
                        continue;
                    }
                    report.errors += 1;
                    publish(errs, SyncError::ConflictExhausted { id, attempts: report.reconcile_attempts }).await;
                    break;
                }
                ReconcileResult::Failed(e) => {
                    report.errors += 1;
                    publish(errs, SyncError::Reconcile(e)).await;
                    break;
                }
            }
        }

        self.report_status(&derived.acceptance, &mut report, errs).await;

        let took_ms = started.elapsed().as_millis() as u64;
        histogram!("sync_pass_ms", took_ms as f64);
        if report.proxy_writes > 0 || report.status_writes > 0 || report.errors > 0 {
            info!(
                epoch = report.epoch,
                proxy_writes = report.proxy_writes,
                status_writes = report.status_writes,
                errors = report.errors,
                took_ms,
                "sync pass"
            );
        } else {
            debug!(epoch = report.epoch, took_ms, "sync pass: nothing to do");
        }
        report
    }

    async fn report_status(&self, acceptance: &[Acceptance], report: &mut PassReport, errs: &mpsc::Sender<SyncError>) {
        let status = self.deps.reporter.report(acceptance).await;
        report.status_writes = status.written;
        for e in status.errors {
            report.errors += 1;
            publish(errs, e).await;
        }
    }

    /// Process snapshots until cancelled or the emitter goes away. A pass in
    /// flight always completes; snapshots that arrive meanwhile collapse into
    /// the latest one.
    pub async fn run(self, mut snapshots: SnapshotRx, errs: mpsc::Sender<SyncError>, cancel: CancellationToken) {
        info!(ns = %self.write_namespace, "event loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = snapshots.changed() => if changed.is_err() { break },
            }
            let latest = snapshots.borrow_and_update().clone();
            if let Some(snapshot) = latest {
                self.sync(&snapshot, &errs).await;
            }
        }
        info!("event loop stopped");
    }
}
