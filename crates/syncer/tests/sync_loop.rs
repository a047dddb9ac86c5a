use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqoop_core::{Kind, Resource, ResourceId, State, Status, StoreError};
use sqoop_store::{ClientFactory, ListOpts, MemoryClient, MemoryStore, ResourceClient, WatchStream};
use sqoop_syncer::{run_sqoop, Opts, Settings, SqoopHandle};

const PETS: &str = "type Query { pets: [Pet] } type Pet { id: ID! name: String }";

fn opts(namespaces: &[&str]) -> Opts {
    let mut o = Opts::from_settings(Settings {
        watch_namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
        refresh_rate: Some(Duration::from_millis(20)),
        ..Default::default()
    });
    o.watch.backoff_initial = Duration::from_millis(5);
    o.watch.backoff_max = Duration::from_millis(50);
    o
}

async fn clients(store: &MemoryStore) -> (MemoryClient, MemoryClient, MemoryClient) {
    let schemas = store.client(Kind::Schema);
    let maps = store.client(Kind::ResolverMap);
    let proxies = store.client(Kind::Proxy);
    for c in [&schemas, &maps, &proxies] {
        c.register().await.unwrap();
    }
    (schemas, maps, proxies)
}

fn schema(ns: &str, name: &str) -> Resource {
    Resource::new(Kind::Schema, ns, name, serde_json::json!({ "inlineSchema": PETS }))
}

fn resolver_map(ns: &str, name: &str, schema: &str) -> Resource {
    Resource::new(
        Kind::ResolverMap,
        ns,
        name,
        serde_json::json!({
            "schema": { "name": schema },
            "types": { "Query": { "fields": { "pets": { "upstream": { "name": "petstore" } } } } }
        }),
    )
}

/// Poll until `pred` holds for the stored resource; returns its last state.
async fn wait_for(client: &MemoryClient, ns: &str, name: &str, pred: impl Fn(Option<&Resource>) -> bool) -> Option<Resource> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = client.read(ns, name).await.unwrap();
        if pred(current.as_ref()) {
            return current;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting on {}.{}: {:?}", ns, name, current);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn state(r: Option<&Resource>) -> Option<State> { r.and_then(|r| r.status.as_ref()).map(|s| s.state) }

async fn stop(handle: SqoopHandle) { handle.shutdown(Duration::from_secs(5)).await.unwrap(); }

#[tokio::test]
async fn inputs_become_proxy_and_status_then_follow_deletion() {
    let store = MemoryStore::new();
    let (schemas, maps, proxies) = clients(&store).await;
    schemas.create(schema("ns1", "s1")).await.unwrap();
    maps.create(resolver_map("ns1", "r1", "s1")).await.unwrap();

    let handle = run_sqoop(opts(&["ns1"]), &store).await.unwrap();

    let proxy = wait_for(&proxies, "gloo-system", "sqoop", |r| r.is_some()).await.unwrap();
    assert_eq!(proxy.spec["listeners"][0]["routes"][0]["prefix"], "/ns1/s1/graphql");
    assert_eq!(proxy.metadata.labels.get("created_by").map(String::as_str), Some("sqoop"));

    let s1 = wait_for(&schemas, "ns1", "s1", |r| state(r) == Some(State::Accepted)).await.unwrap();
    assert_eq!(s1.status.unwrap().reported_by, "sqoop");
    wait_for(&maps, "ns1", "r1", |r| state(r) == Some(State::Accepted)).await;
    assert!(handle.endpoints().get("ns1", "s1").is_some());

    let s1 = schemas.read("ns1", "s1").await.unwrap().unwrap();
    schemas.delete("ns1", "s1", Some(s1.resource_version())).await.unwrap();

    let r1 = wait_for(&maps, "ns1", "r1", |r| state(r) == Some(State::Rejected)).await.unwrap();
    assert_eq!(r1.status.unwrap().reason.as_deref(), Some("missing schema ns1.s1"));
    // No valid endpoint is left, so the managed proxy goes away.
    wait_for(&proxies, "gloo-system", "sqoop", |r| r.is_none()).await;
    assert!(handle.endpoints().is_empty());

    stop(handle).await;
}

#[tokio::test]
async fn converged_state_is_not_rewritten_by_later_passes() {
    let store = MemoryStore::new();
    let (schemas, maps, proxies) = clients(&store).await;
    schemas.create(schema("ns1", "s1")).await.unwrap();
    maps.create(resolver_map("ns1", "r1", "s1")).await.unwrap();

    let handle = run_sqoop(opts(&["ns1"]), &store).await.unwrap();
    wait_for(&maps, "ns1", "r1", |r| state(r) == Some(State::Accepted)).await;
    wait_for(&schemas, "ns1", "s1", |r| state(r) == Some(State::Accepted)).await;

    let versions = |p: &Resource, s: &Resource, m: &Resource| {
        (p.metadata.resource_version.clone(), s.metadata.resource_version.clone(), m.metadata.resource_version.clone())
    };
    let before = versions(
        &proxies.read("gloo-system", "sqoop").await.unwrap().unwrap(),
        &schemas.read("ns1", "s1").await.unwrap().unwrap(),
        &maps.read("ns1", "r1").await.unwrap().unwrap(),
    );
    // Many periodic passes.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = versions(
        &proxies.read("gloo-system", "sqoop").await.unwrap().unwrap(),
        &schemas.read("ns1", "s1").await.unwrap().unwrap(),
        &maps.read("ns1", "r1").await.unwrap().unwrap(),
    );
    assert_eq!(before, after);

    stop(handle).await;
}

#[tokio::test]
async fn drift_on_managed_proxy_is_repaired() {
    let store = MemoryStore::new();
    let (schemas, maps, proxies) = clients(&store).await;
    schemas.create(schema("ns1", "s1")).await.unwrap();
    maps.create(resolver_map("ns1", "r1", "s1")).await.unwrap();

    let handle = run_sqoop(opts(&["ns1"]), &store).await.unwrap();
    let mut proxy = wait_for(&proxies, "gloo-system", "sqoop", |r| r.is_some()).await.unwrap();
    let desired = proxy.spec.clone();

    proxy.spec = serde_json::json!({ "listeners": [] });
    proxies.update(proxy).await.unwrap();

    let repaired = wait_for(&proxies, "gloo-system", "sqoop", |r| r.map(|p| p.spec == desired).unwrap_or(false)).await;
    assert!(repaired.is_some());

    stop(handle).await;
}

#[tokio::test]
async fn inputs_outside_watched_namespaces_are_ignored() {
    let store = MemoryStore::new();
    let (schemas, maps, proxies) = clients(&store).await;
    schemas.create(schema("elsewhere", "s9")).await.unwrap();
    maps.create(resolver_map("elsewhere", "r9", "s9")).await.unwrap();
    schemas.create(schema("ns1", "s1")).await.unwrap();

    let handle = run_sqoop(opts(&["ns1"]), &store).await.unwrap();
    wait_for(&schemas, "ns1", "s1", |r| state(r) == Some(State::Accepted)).await;
    let proxy = wait_for(&proxies, "gloo-system", "sqoop", |r| r.is_some()).await.unwrap();
    let routes = proxy.spec["listeners"][0]["routes"].as_array().cloned().unwrap_or_default();
    assert_eq!(routes.len(), 1);
    assert!(schemas.read("elsewhere", "s9").await.unwrap().unwrap().status.is_none());

    stop(handle).await;
}

#[tokio::test]
async fn invalid_resolver_map_is_rejected_while_valid_inputs_reconcile() {
    let store = MemoryStore::new();
    let (schemas, maps, proxies) = clients(&store).await;
    schemas.create(schema("ns1", "s1")).await.unwrap();
    maps.create(resolver_map("ns1", "r1", "s1")).await.unwrap();
    maps.create(resolver_map("ns1", "r2", "s2")).await.unwrap();

    let handle = run_sqoop(opts(&["ns1"]), &store).await.unwrap();
    let r2 = wait_for(&maps, "ns1", "r2", |r| state(r) == Some(State::Rejected)).await.unwrap();
    assert_eq!(r2.status.unwrap().reason.as_deref(), Some("missing schema ns1.s2"));
    wait_for(&maps, "ns1", "r1", |r| state(r) == Some(State::Accepted)).await;
    wait_for(&schemas, "ns1", "s1", |r| state(r) == Some(State::Accepted)).await;
    let proxy = wait_for(&proxies, "gloo-system", "sqoop", |r| r.is_some()).await.unwrap();
    assert_eq!(proxy.spec["listeners"][0]["routes"][0]["prefix"], "/ns1/s1/graphql");

    stop(handle).await;
}

/// Proxy client that fails the first `n` creates with a version conflict.
struct ConflictingProxies {
    inner: MemoryClient,
    remaining: AtomicU32,
}

#[async_trait::async_trait]
impl ResourceClient for ConflictingProxies {
    fn kind(&self) -> Kind { self.inner.kind() }
    async fn register(&self) -> Result<(), StoreError> { self.inner.register().await }
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Resource>, StoreError> {
        self.inner.read(namespace, name).await
    }
    async fn list(&self, namespace: &str, opts: &ListOpts) -> Result<Vec<Resource>, StoreError> {
        self.inner.list(namespace, opts).await
    }
    async fn watch(&self, namespace: &str, opts: &ListOpts) -> Result<WatchStream, StoreError> {
        self.inner.watch(namespace, opts).await
    }
    async fn create(&self, resource: Resource) -> Result<Resource, StoreError> {
        if self.remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(StoreError::Conflict { id: resource.id(), expected: String::new(), actual: "1".into() });
        }
        self.inner.create(resource).await
    }
    async fn update(&self, resource: Resource) -> Result<Resource, StoreError> { self.inner.update(resource).await }
    async fn update_status(&self, id: &ResourceId, rv: &str, status: Status) -> Result<Resource, StoreError> {
        self.inner.update_status(id, rv, status).await
    }
    async fn delete(&self, namespace: &str, name: &str, rv: Option<&str>) -> Result<(), StoreError> {
        self.inner.delete(namespace, name, rv).await
    }
}

struct FlakyFactory {
    store: MemoryStore,
    proxies: Arc<ConflictingProxies>,
}

#[async_trait::async_trait]
impl ClientFactory for FlakyFactory {
    async fn client(&self, kind: Kind) -> Result<Arc<dyn ResourceClient>, StoreError> {
        match kind {
            Kind::Proxy => Ok(self.proxies.clone()),
            other => Ok(Arc::new(self.store.client(other))),
        }
    }
}

#[tokio::test]
async fn one_conflict_is_absorbed_by_retry() {
    let store = MemoryStore::new();
    let (schemas, maps, proxies) = clients(&store).await;
    schemas.create(schema("ns1", "s1")).await.unwrap();
    maps.create(resolver_map("ns1", "r1", "s1")).await.unwrap();
    let factory = FlakyFactory {
        store: store.clone(),
        proxies: Arc::new(ConflictingProxies { inner: proxies.clone(), remaining: AtomicU32::new(1) }),
    };

    let handle = run_sqoop(opts(&["ns1"]), &factory).await.unwrap();
    wait_for(&proxies, "gloo-system", "sqoop", |r| r.is_some()).await;
    wait_for(&maps, "ns1", "r1", |r| state(r) == Some(State::Accepted)).await;
    assert_eq!(factory.proxies.remaining.load(Ordering::SeqCst), 0);

    let logged = handle.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(logged, 0, "retried conflict must not surface as an error");
}

struct BrokenFactory;

#[async_trait::async_trait]
impl ClientFactory for BrokenFactory {
    async fn client(&self, _kind: Kind) -> Result<Arc<dyn ResourceClient>, StoreError> {
        Err(StoreError::Backend("connection refused".into()))
    }
}

#[tokio::test]
async fn startup_failure_is_returned() {
    let err = run_sqoop(opts(&["ns1"]), &BrokenFactory).await.err().unwrap();
    let chain = format!("{:#}", err);
    assert!(chain.contains("constructing Proxy client"), "{}", chain);
    assert!(chain.contains("connection refused"), "{}", chain);
}

#[tokio::test]
async fn shutdown_completes_with_nothing_to_do() {
    let store = MemoryStore::new();
    let handle = run_sqoop(opts(&["ns1"]), &store).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let logged = handle.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(logged, 0);
}

/// Schema client whose first `n` watch attempts fail to establish.
struct LateSchemas {
    inner: MemoryClient,
    failures: AtomicU32,
}

#[async_trait::async_trait]
impl ResourceClient for LateSchemas {
    fn kind(&self) -> Kind { self.inner.kind() }
    async fn register(&self) -> Result<(), StoreError> { self.inner.register().await }
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Resource>, StoreError> {
        self.inner.read(namespace, name).await
    }
    async fn list(&self, namespace: &str, opts: &ListOpts) -> Result<Vec<Resource>, StoreError> {
        self.inner.list(namespace, opts).await
    }
    async fn watch(&self, namespace: &str, opts: &ListOpts) -> Result<WatchStream, StoreError> {
        if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(StoreError::Backend("watch not ready".into()));
        }
        self.inner.watch(namespace, opts).await
    }
    async fn create(&self, resource: Resource) -> Result<Resource, StoreError> { self.inner.create(resource).await }
    async fn update(&self, resource: Resource) -> Result<Resource, StoreError> { self.inner.update(resource).await }
    async fn update_status(&self, id: &ResourceId, rv: &str, status: Status) -> Result<Resource, StoreError> {
        self.inner.update_status(id, rv, status).await
    }
    async fn delete(&self, namespace: &str, name: &str, rv: Option<&str>) -> Result<(), StoreError> {
        self.inner.delete(namespace, name, rv).await
    }
}

struct LateSchemaFactory {
    store: MemoryStore,
    schemas: Arc<LateSchemas>,
}

#[async_trait::async_trait]
impl ClientFactory for LateSchemaFactory {
    async fn client(&self, kind: Kind) -> Result<Arc<dyn ResourceClient>, StoreError> {
        match kind {
            Kind::Schema => Ok(self.schemas.clone()),
            other => Ok(Arc::new(self.store.client(other))),
        }
    }
}

#[tokio::test]
async fn late_watch_never_deletes_proxy_or_rejects_inputs() {
    let store = MemoryStore::new();
    let (schemas, maps, proxies) = clients(&store).await;
    schemas.create(schema("ns1", "s1")).await.unwrap();
    maps.create(resolver_map("ns1", "r1", "s1")).await.unwrap();
    let managed = Resource::new(Kind::Proxy, "gloo-system", "sqoop", serde_json::json!({ "listeners": [] }))
        .with_label("created_by", "sqoop");
    proxies.create(managed).await.unwrap();
    let factory = LateSchemaFactory {
        store: store.clone(),
        schemas: Arc::new(LateSchemas { inner: schemas.clone(), failures: AtomicU32::new(3) }),
    };

    let handle = run_sqoop(opts(&["ns1"]), &factory).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let proxy = proxies.read("gloo-system", "sqoop").await.unwrap();
        let r1 = maps.read("ns1", "r1").await.unwrap();
        assert!(proxy.is_some(), "managed proxy deleted while schemas were unsynced");
        assert_ne!(state(r1.as_ref()), Some(State::Rejected), "r1 rejected while schemas were unsynced: {:?}", r1);
        if state(r1.as_ref()) == Some(State::Accepted) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "r1 never accepted");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(factory.schemas.failures.load(Ordering::SeqCst), 0);
    let proxy = wait_for(&proxies, "gloo-system", "sqoop", |r| {
        r.map(|p| p.spec["listeners"][0]["routes"][0]["prefix"] == "/ns1/s1/graphql").unwrap_or(false)
    })
    .await;
    assert!(proxy.is_some());

    let logged = handle.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(logged, 3, "each failed establishment is logged once");
}
