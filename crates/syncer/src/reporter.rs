//! Status reporter: writes each input's acceptance back onto the input.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use sqoop_core::{Acceptance, Kind, StoreError};
use sqoop_store::ResourceClient;
use tracing::debug;

use crate::SyncError;

#[derive(Debug, Default)]
pub struct ReportSummary {
    pub written: usize,
    /// Observed status already matched the outcome.
    pub unchanged: usize,
    /// The input moved on (new version or deleted) since the snapshot.
    pub stale: usize,
    pub errors: Vec<SyncError>,
}

#[async_trait]
pub trait Report: Send + Sync {
    async fn report(&self, acceptance: &[Acceptance]) -> ReportSummary;
}

pub struct StatusReporter {
    name: String,
    clients: BTreeMap<Kind, Arc<dyn ResourceClient>>,
}

impl StatusReporter {
    pub fn new(name: impl Into<String>, clients: impl IntoIterator<Item = Arc<dyn ResourceClient>>) -> Self {
        Self { name: name.into(), clients: clients.into_iter().map(|c| (c.kind(), c)).collect() }
    }
}

#[async_trait]
impl Report for StatusReporter {
    async fn report(&self, acceptance: &[Acceptance]) -> ReportSummary {
        let mut out = ReportSummary::default();
        for a in acceptance {
            let status = a.outcome.to_status(&self.name);
            if a.observed.as_ref() == Some(&status) {
                out.unchanged += 1;
                continue;
            }
            let Some(client) = self.clients.get(&a.id.kind) else {
                out.errors.push(SyncError::Status { id: a.id.clone(), source: StoreError::NotRegistered(a.id.kind) });
                continue;
            };
            // Written against the version the outcome was computed from.
            match client.update_status(&a.id, &a.resource_version, status).await {
                Ok(_) => {
                    counter!("status_writes_total", 1u64);
                    out.written += 1;
                }
                Err(e @ (StoreError::Conflict { .. } | StoreError::NotFound(_))) => {
                    debug!(id = %a.id, error = %e, "status skipped; input changed since snapshot");
                    out.stale += 1;
                }
                Err(e) => out.errors.push(SyncError::Status { id: a.id.clone(), source: e }),
            }
        }
        out
    }
}
