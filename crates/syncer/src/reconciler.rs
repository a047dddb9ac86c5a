//! Proxy reconciler: makes the managed proxies in one namespace match the
//! desired set. Only resources carrying the ownership label are touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use sqoop_core::{ReconcileResult, ReconcileSummary, Resource, StoreError};
use sqoop_store::{ListOpts, ResourceClient};
use tracing::{debug, info};

pub const OWNER_LABEL: &str = "created_by";
pub const OWNER: &str = "sqoop";

#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Converge the namespace towards `desired`. An empty set deletes every
    /// managed resource.
    async fn reconcile(&self, namespace: &str, desired: &[Resource]) -> ReconcileResult;
}

pub struct ProxyReconciler {
    client: Arc<dyn ResourceClient>,
    owned: ListOpts,
}

impl ProxyReconciler {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self { client, owned: ListOpts::default().with_label(OWNER_LABEL, OWNER) }
    }
}

fn needs_update(current: &Resource, desired: &Resource) -> bool {
    current.spec != desired.spec || current.metadata.labels != desired.metadata.labels
}

/// Map a write failure onto the result. Version races become `Conflict` so the
/// caller can retry against fresh state.
fn write_failed(error: StoreError, partial: ReconcileSummary) -> ReconcileResult {
    match error {
        StoreError::Conflict { id, .. } | StoreError::AlreadyExists(id) => ReconcileResult::Conflict { id, partial },
        other => ReconcileResult::Failed(other),
    }
}

#[async_trait]
impl Reconcile for ProxyReconciler {
    async fn reconcile(&self, namespace: &str, desired: &[Resource]) -> ReconcileResult {
        let current = match self.client.list(namespace, &self.owned).await {
            Ok(items) => items,
            Err(e) => return ReconcileResult::Failed(e),
        };
        let mut current: BTreeMap<String, Resource> =
            current.into_iter().map(|r| (r.metadata.name.clone(), r)).collect();

        let mut summary = ReconcileSummary::default();
        for d in desired {
            let mut want = d.clone().with_label(OWNER_LABEL, OWNER);
            want.metadata.namespace = namespace.to_string();
            want.status = None;
            match current.remove(&want.metadata.name) {
                None => {
                    want.metadata.resource_version.clear();
                    let id = want.id();
                    if let Err(e) = self.client.create(want).await {
                        return write_failed(e, summary);
                    }
                    debug!(id = %id, "proxy created");
                    counter!("proxy_writes_total", 1u64, "op" => "create");
                    summary.created += 1;
                }
                Some(have) if needs_update(&have, &want) => {
                    want.metadata.resource_version = have.metadata.resource_version.clone();
                    want.metadata.uid = have.metadata.uid.clone();
                    let id = want.id();
                    if let Err(e) = self.client.update(want).await {
                        return write_failed(e, summary);
                    }
                    debug!(id = %id, "proxy updated");
                    counter!("proxy_writes_total", 1u64, "op" => "update");
                    summary.updated += 1;
                }
                Some(_) => summary.unchanged += 1,
            }
        }

        // Whatever is left is managed but no longer desired.
        for (name, stale) in current {
            match self.client.delete(namespace, &name, Some(stale.resource_version())).await {
                Ok(()) => {
                    debug!(id = %stale.id(), "proxy deleted");
                    counter!("proxy_writes_total", 1u64, "op" => "delete");
                    summary.deleted += 1;
                }
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return write_failed(e, summary),
            }
        }

        if summary.writes() > 0 {
            info!(
                ns = %namespace,
                created = summary.created,
                updated = summary.updated,
                deleted = summary.deleted,
                "proxies reconciled"
            );
        }
        ReconcileResult::Converged(summary)
    }
}
