//! Sqoop store: typed resource client contract, in-memory backend and the
//! snapshot builder used by the emitter.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::BoxStream;
use sqoop_core::{Kind, Resource, ResourceId, Snapshot, Status, StoreError};
use tracing::debug;

pub mod memory;

pub use memory::{MemoryClient, MemoryStore};

/// Each item is the full current list of one kind in one namespace.
pub type WatchStream = BoxStream<'static, Result<Vec<Resource>, StoreError>>;

/// Options for list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOpts {
    /// Label selector; every pair must match.
    pub selector: BTreeMap<String, String>,
}

impl ListOpts {
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.selector.insert(key.to_string(), value.to_string());
        self
    }
}

/// Typed CRUD + watch access to one resource kind.
///
/// Writes use the resource version as a compare-and-swap precondition: a
/// mismatch yields [`StoreError::Conflict`].
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync {
    fn kind(&self) -> Kind;

    /// Register the kind with the store. Must succeed before any other call.
    async fn register(&self) -> Result<(), StoreError>;

    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Resource>, StoreError>;

    /// List resources in a namespace, ordered by name.
    async fn list(&self, namespace: &str, opts: &ListOpts) -> Result<Vec<Resource>, StoreError>;

    /// Watch a namespace. The first item is the initial list; later items are
    /// emitted whenever the list changes.
    async fn watch(&self, namespace: &str, opts: &ListOpts) -> Result<WatchStream, StoreError>;

    async fn create(&self, resource: Resource) -> Result<Resource, StoreError>;

    /// Replace spec and labels. `resource.metadata.resource_version` is the precondition.
    async fn update(&self, resource: Resource) -> Result<Resource, StoreError>;

    async fn update_status(&self, id: &ResourceId, resource_version: &str, status: Status) -> Result<Resource, StoreError>;

    /// Delete, optionally guarded by a resource version precondition.
    async fn delete(&self, namespace: &str, name: &str, resource_version: Option<&str>) -> Result<(), StoreError>;
}

/// Produces one client per kind for a given backend.
#[async_trait::async_trait]
pub trait ClientFactory: Send + Sync {
    async fn client(&self, kind: Kind) -> Result<Arc<dyn ResourceClient>, StoreError>;
}

/// Builds snapshots from per-(kind, namespace) lists.
///
/// Each watch reports the full list for its pair, so applying a list replaces
/// whatever that pair contributed before. A pair that stops reporting keeps
/// its last list.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    epoch: u64,
    expected: BTreeSet<(Kind, String)>,
    lists: BTreeMap<(Kind, String), Vec<Resource>>,
}

impl SnapshotBuilder {
    pub fn new() -> Self { Self::default() }

    /// A builder whose snapshots mark any of `pairs` that has not listed yet
    /// as unsynced.
    pub fn expecting(pairs: impl IntoIterator<Item = (Kind, String)>) -> Self {
        Self { expected: pairs.into_iter().collect(), ..Self::default() }
    }

    /// Replace the list for one pair. Returns true when the content changed.
    pub fn apply(&mut self, kind: Kind, namespace: &str, items: Vec<Resource>) -> bool {
        let key = (kind, namespace.to_string());
        if self.lists.get(&key) == Some(&items) {
            return false;
        }
        debug!(kind = %kind, ns = %namespace, count = items.len(), "snapshot builder: list replaced");
        self.lists.insert(key, items);
        true
    }

    /// Pairs that have reported at least once.
    pub fn synced(&self) -> BTreeSet<(Kind, String)> { self.lists.keys().cloned().collect() }

    pub fn epoch(&self) -> u64 { self.epoch }

    /// Freeze the current union into an immutable snapshot with a fresh epoch.
    pub fn freeze(&mut self) -> Arc<Snapshot> {
        self.epoch = self.epoch.saturating_add(1);
        let unsynced = self.expected.iter().filter(|p| !self.lists.contains_key(*p)).cloned().collect();
        let mut snap = Snapshot { epoch: self.epoch, unsynced, ..Default::default() };
        for ((kind, _ns), items) in self.lists.iter() {
            let target = match kind {
                Kind::Schema => &mut snap.schemas,
                Kind::ResolverMap => &mut snap.resolver_maps,
                Kind::Proxy => continue,
            };
            for r in items {
                target.insert(r.id(), r.clone());
            }
        }
        Arc::new(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(ns: &str, name: &str) -> Resource {
        Resource::new(Kind::Schema, ns, name, serde_json::json!({ "inlineSchema": "type Query { a: Int }" }))
    }

    #[test]
    fn apply_reports_changes_only() {
        let mut b = SnapshotBuilder::new();
        assert!(b.apply(Kind::Schema, "ns1", vec![schema("ns1", "s1")]));
        assert!(!b.apply(Kind::Schema, "ns1", vec![schema("ns1", "s1")]));
        assert!(b.apply(Kind::Schema, "ns1", vec![]));
        assert!(b.synced().contains(&(Kind::Schema, "ns1".to_string())));
    }

    #[test]
    fn freeze_increments_epoch_and_skips_proxies() {
        let mut b = SnapshotBuilder::new();
        b.apply(Kind::Schema, "ns1", vec![schema("ns1", "s1")]);
        b.apply(Kind::Proxy, "ns1", vec![Resource::new(Kind::Proxy, "ns1", "p", serde_json::json!({}))]);
        let s1 = b.freeze();
        let s2 = b.freeze();
        assert_eq!(s1.epoch, 1);
        assert_eq!(s2.epoch, 2);
        assert_eq!(s2.len(), 1);
    }

    #[test]
    fn pairs_that_never_listed_are_marked_unsynced() {
        let maps = (Kind::ResolverMap, "ns1".to_string());
        let mut b = SnapshotBuilder::expecting([(Kind::Schema, "ns1".to_string()), maps.clone()]);
        b.apply(Kind::Schema, "ns1", vec![schema("ns1", "s1")]);
        let partial = b.freeze();
        assert!(!partial.is_complete());
        assert_eq!(partial.unsynced.iter().collect::<Vec<_>>(), vec![&maps]);

        // An empty list is a real answer.
        b.apply(Kind::ResolverMap, "ns1", vec![]);
        let full = b.freeze();
        assert!(full.is_complete());
        assert_eq!(full.len(), 1);
    }
}
