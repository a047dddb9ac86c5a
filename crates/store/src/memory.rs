//! In-memory backend. Single process, shared by clone.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use sqoop_core::{Kind, Resource, ResourceId, Status, StoreError};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::{ClientFactory, ListOpts, ResourceClient, WatchStream};

#[derive(Default)]
struct State {
    registered: FxHashSet<Kind>,
    objects: FxHashMap<ResourceId, Resource>,
    last_rv: u64,
}

impl State {
    fn next_rv(&mut self) -> String {
        self.last_rv = self.last_rv.saturating_add(1);
        self.last_rv.to_string()
    }

    fn ensure_registered(&self, kind: Kind) -> Result<(), StoreError> {
        if self.registered.contains(&kind) { Ok(()) } else { Err(StoreError::NotRegistered(kind)) }
    }

    fn list(&self, kind: Kind, namespace: &str, opts: &ListOpts) -> Vec<Resource> {
        let mut out: Vec<Resource> = self
            .objects
            .values()
            .filter(|r| r.kind == kind && r.metadata.namespace == namespace && r.matches(&opts.selector))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        out
    }
}

struct Inner {
    state: Mutex<State>,
    /// Bumped on every write; watchers relist when it moves.
    revision: watch::Sender<u64>,
}

/// Shared in-memory store. Cloning yields another handle to the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (revision, _rx) = watch::channel(0u64);
        Self { inner: Arc::new(Inner { state: Mutex::new(State::default()), revision }) }
    }

    pub fn client(&self, kind: Kind) -> MemoryClient { MemoryClient { store: self.clone(), kind } }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.inner.state.lock().map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    fn bump(&self) { self.inner.revision.send_modify(|r| *r = r.wrapping_add(1)); }
}

#[async_trait::async_trait]
impl ClientFactory for MemoryStore {
    async fn client(&self, kind: Kind) -> Result<Arc<dyn ResourceClient>, StoreError> {
        Ok(Arc::new(MemoryStore::client(self, kind)))
    }
}

/// Client for one kind backed by a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryClient {
    store: MemoryStore,
    kind: Kind,
}

impl MemoryClient {
    fn check_kind(&self, r: &Resource) -> Result<(), StoreError> {
        if r.kind != self.kind {
            return Err(StoreError::Invalid { id: r.id(), reason: format!("client serves {}", self.kind) });
        }
        if r.metadata.name.is_empty() || r.metadata.namespace.is_empty() {
            return Err(StoreError::Invalid { id: r.id(), reason: "name and namespace are required".into() });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceClient for MemoryClient {
    fn kind(&self) -> Kind { self.kind }

    async fn register(&self) -> Result<(), StoreError> {
        self.store.lock()?.registered.insert(self.kind);
        debug!(kind = %self.kind, "memory: kind registered");
        Ok(())
    }

    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Resource>, StoreError> {
        let st = self.store.lock()?;
        st.ensure_registered(self.kind)?;
        Ok(st.objects.get(&ResourceId::new(self.kind, namespace, name)).cloned())
    }

    async fn list(&self, namespace: &str, opts: &ListOpts) -> Result<Vec<Resource>, StoreError> {
        let st = self.store.lock()?;
        st.ensure_registered(self.kind)?;
        Ok(st.list(self.kind, namespace, opts))
    }

    async fn watch(&self, namespace: &str, opts: &ListOpts) -> Result<WatchStream, StoreError> {
        self.store.lock()?.ensure_registered(self.kind)?;
        let rx = self.store.inner.revision.subscribe();
        let store = self.store.clone();
        let kind = self.kind;
        let ns = namespace.to_string();
        let opts = opts.clone();
        // (revision receiver, last emitted list, first poll)
        let stream = futures::stream::unfold((rx, None::<Vec<Resource>>, true), move |(mut rx, last, first)| {
            let store = store.clone();
            let ns = ns.clone();
            let opts = opts.clone();
            async move {
                if !first && rx.changed().await.is_err() {
                    return None;
                }
                let mut last = last;
                loop {
                    rx.borrow_and_update();
                    let current = match store.lock() {
                        Ok(st) => st.list(kind, &ns, &opts),
                        Err(e) => return Some((Err(e), (rx, last, false))),
                    };
                    if last.as_ref() != Some(&current) {
                        last = Some(current.clone());
                        return Some((Ok(current), (rx, last, false)));
                    }
                    // Unrelated write; wait for the next revision.
                    if rx.changed().await.is_err() {
                        return None;
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn create(&self, mut resource: Resource) -> Result<Resource, StoreError> {
        self.check_kind(&resource)?;
        let id = resource.id();
        let out = {
            let mut st = self.store.lock()?;
            st.ensure_registered(self.kind)?;
            if !resource.metadata.resource_version.is_empty() {
                return Err(StoreError::Invalid { id, reason: "resource version must be empty on create".into() });
            }
            if st.objects.contains_key(&id) {
                return Err(StoreError::AlreadyExists(id));
            }
            resource.metadata.resource_version = st.next_rv();
            resource.metadata.uid = Some(Uuid::new_v4().to_string());
            st.objects.insert(id, resource.clone());
            resource
        };
        counter!("memory_store_writes_total", 1u64);
        self.store.bump();
        Ok(out)
    }

    async fn update(&self, resource: Resource) -> Result<Resource, StoreError> {
        self.check_kind(&resource)?;
        let id = resource.id();
        let out = {
            let mut st = self.store.lock()?;
            st.ensure_registered(self.kind)?;
            let rv = st.next_rv();
            let stored = st.objects.get_mut(&id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if stored.metadata.resource_version != resource.metadata.resource_version {
                return Err(StoreError::Conflict {
                    id,
                    expected: resource.metadata.resource_version.clone(),
                    actual: stored.metadata.resource_version.clone(),
                });
            }
            // Status lives in its own subresource.
            stored.spec = resource.spec;
            stored.metadata.labels = resource.metadata.labels;
            stored.metadata.resource_version = rv;
            stored.clone()
        };
        counter!("memory_store_writes_total", 1u64);
        self.store.bump();
        Ok(out)
    }

    async fn update_status(&self, id: &ResourceId, resource_version: &str, status: Status) -> Result<Resource, StoreError> {
        let out = {
            let mut st = self.store.lock()?;
            st.ensure_registered(self.kind)?;
            let rv = st.next_rv();
            let stored = st.objects.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if stored.metadata.resource_version != resource_version {
                return Err(StoreError::Conflict {
                    id: id.clone(),
                    expected: resource_version.to_string(),
                    actual: stored.metadata.resource_version.clone(),
                });
            }
            stored.status = Some(status);
            stored.metadata.resource_version = rv;
            stored.clone()
        };
        counter!("memory_store_writes_total", 1u64);
        self.store.bump();
        Ok(out)
    }

    async fn delete(&self, namespace: &str, name: &str, resource_version: Option<&str>) -> Result<(), StoreError> {
        let id = ResourceId::new(self.kind, namespace, name);
        {
            let mut st = self.store.lock()?;
            st.ensure_registered(self.kind)?;
            let stored = st.objects.get(&id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if let Some(rv) = resource_version {
                if stored.metadata.resource_version != rv {
                    return Err(StoreError::Conflict {
                        id,
                        expected: rv.to_string(),
                        actual: stored.metadata.resource_version.clone(),
                    });
                }
            }
            st.objects.remove(&id);
        }
        counter!("memory_store_writes_total", 1u64);
        self.store.bump();
        Ok(())
    }
}
