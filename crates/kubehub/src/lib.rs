//! Sqoop kubehub: `ResourceClient` over kube dynamic objects.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use sqoop_core::{Kind, Resource, ResourceId, Status, StoreError};
use sqoop_store::{ClientFactory, ListOpts, ResourceClient, WatchStream};
use tracing::{debug, info, warn};

/// Static API resource for one of our kinds; no discovery round-trip needed.
pub fn api_resource(kind: Kind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.as_str());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

/// CRD for a kind: namespaced, status subresource, schemaless spec.
pub fn crd_for(kind: Kind) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": format!("{}.{}", kind.plural(), kind.group()) },
        "spec": {
            "group": kind.group(),
            "scope": "Namespaced",
            "names": {
                "kind": kind.as_str(),
                "listKind": format!("{}List", kind.as_str()),
                "plural": kind.plural(),
                "singular": kind.as_str().to_lowercase(),
            },
            "versions": [{
                "name": kind.version(),
                "served": true,
                "storage": true,
                "subresources": { "status": {} },
                "schema": { "openAPIV3Schema": { "type": "object", "x-kubernetes-preserve-unknown-fields": true } }
            }]
        }
    })
}

fn selector_string(opts: &ListOpts) -> Option<String> {
    if opts.selector.is_empty() {
        return None;
    }
    Some(opts.selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","))
}

fn to_resource(kind: Kind, obj: DynamicObject) -> Result<Resource, StoreError> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    if name.is_empty() {
        return Err(StoreError::Invalid { id: ResourceId::new(kind, namespace, name), reason: "object missing metadata.name".into() });
    }
    let mut r = Resource::new(kind, namespace, name, obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null));
    r.metadata.resource_version = obj.metadata.resource_version.unwrap_or_default();
    r.metadata.labels = obj.metadata.labels.unwrap_or_default();
    r.metadata.uid = obj.metadata.uid;
    r.status = match obj.data.get("status") {
        Some(v) => match serde_json::from_value::<Status>(v.clone()) {
            Ok(s) => Some(s),
            Err(e) => {
                debug!(id = %r.id(), error = %e, "ignoring foreign status");
                None
            }
        },
        None => None,
    };
    Ok(r)
}

fn to_dynamic(ar: &ApiResource, r: &Resource) -> DynamicObject {
    let mut data = serde_json::json!({ "spec": r.spec });
    if let Some(status) = &r.status {
        data["status"] = serde_json::to_value(status).unwrap_or(serde_json::Value::Null);
    }
    let mut obj = DynamicObject::new(&r.metadata.name, ar).within(&r.metadata.namespace).data(data);
    if !r.metadata.labels.is_empty() {
        obj.metadata.labels = Some(r.metadata.labels.clone());
    }
    if !r.metadata.resource_version.is_empty() {
        obj.metadata.resource_version = Some(r.metadata.resource_version.clone());
    }
    obj
}

fn map_err(id: &ResourceId, expected: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists(id.clone()),
        kube::Error::Api(ae) if ae.code == 409 => {
            StoreError::Conflict { id: id.clone(), expected: expected.to_string(), actual: String::new() }
        }
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(id.clone()),
        other => StoreError::Backend(other.to_string()),
    }
}

/// Builds kube-backed clients from the current kube context.
#[derive(Clone)]
pub struct KubeFactory {
    client: Client,
}

impl KubeFactory {
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client from current context")?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl ClientFactory for KubeFactory {
    async fn client(&self, kind: Kind) -> Result<Arc<dyn ResourceClient>, StoreError> {
        Ok(Arc::new(KubeClient::new(self.client.clone(), kind)))
    }
}

pub struct KubeClient {
    client: Client,
    kind: Kind,
    ar: ApiResource,
}

impl KubeClient {
    pub fn new(client: Client, kind: Kind) -> Self { Self { client, kind, ar: api_resource(kind) } }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.ar)
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeClient {
    fn kind(&self) -> Kind { self.kind }

    async fn register(&self) -> Result<(), StoreError> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crd: CustomResourceDefinition =
            serde_json::from_value(crd_for(self.kind)).map_err(|e| StoreError::Backend(format!("building CRD: {e}")))?;
        match crds.create(&PostParams::default(), &crd).await {
            Ok(_) => info!(kind = %self.kind, "CRD registered"),
            Err(kube::Error::Api(ae)) if ae.code == 409 => debug!(kind = %self.kind, "CRD already registered"),
            Err(e) => return Err(StoreError::Backend(format!("registering {} CRD: {}", self.kind, e))),
        }
        Ok(())
    }

    async fn read(&self, namespace: &str, name: &str) -> Result<Option<Resource>, StoreError> {
        let id = ResourceId::new(self.kind, namespace, name);
        match self.api(namespace).get_opt(name).await.map_err(|e| map_err(&id, "", e))? {
            Some(o) => Ok(Some(to_resource(self.kind, o)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, namespace: &str, opts: &ListOpts) -> Result<Vec<Resource>, StoreError> {
        let mut lp = ListParams::default();
        if let Some(sel) = selector_string(opts) {
            lp = lp.labels(&sel);
        }
        let list = self
            .api(namespace)
            .list(&lp)
            .await
            .map_err(|e| StoreError::Backend(format!("listing {} in {}: {}", self.kind, namespace, e)))?;
        let mut out = list.items.into_iter().map(|o| to_resource(self.kind, o)).collect::<Result<Vec<_>, _>>()?;
        out.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(out)
    }

    async fn watch(&self, namespace: &str, opts: &ListOpts) -> Result<WatchStream, StoreError> {
        let mut cfg = watcher::Config::default();
        if let Some(sel) = selector_string(opts) {
            cfg = cfg.labels(&sel);
        }
        let events = watcher::watcher(self.api(namespace), cfg).boxed();
        let kind = self.kind;
        info!(kind = %kind, ns = %namespace, "watcher started");
        // Keep a name-indexed cache so every item is the full current list.
        let stream = futures::stream::unfold((events, BTreeMap::<String, Resource>::new()), move |(mut events, mut items)| async move {
            let item = match events.next().await? {
                Ok(Event::Applied(o)) => to_resource(kind, o).map(|r| {
                    items.insert(r.metadata.name.clone(), r);
                }),
                Ok(Event::Deleted(o)) => {
                    items.remove(o.metadata.name.as_deref().unwrap_or_default());
                    Ok(())
                }
                Ok(Event::Restarted(list)) => {
                    debug!(kind = %kind, count = list.len(), "watch restart");
                    items.clear();
                    list.into_iter().try_for_each(|o| {
                        let r = to_resource(kind, o)?;
                        items.insert(r.metadata.name.clone(), r);
                        Ok::<(), StoreError>(())
                    })
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "watcher error");
                    Err(StoreError::Backend(format!("watch {}: {}", kind, e)))
                }
            };
            let out = item.map(|_| items.values().cloned().collect::<Vec<_>>());
            Some((out, (events, items)))
        });
        Ok(stream.boxed())
    }

    async fn create(&self, resource: Resource) -> Result<Resource, StoreError> {
        let id = resource.id();
        let obj = to_dynamic(&self.ar, &resource);
        let created = self
            .api(&resource.metadata.namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_err(&id, "", e))?;
        counter!("kube_writes_total", 1u64);
        to_resource(self.kind, created)
    }

    async fn update(&self, resource: Resource) -> Result<Resource, StoreError> {
        let id = resource.id();
        let obj = to_dynamic(&self.ar, &resource);
        let updated = self
            .api(&resource.metadata.namespace)
            .replace(&resource.metadata.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_err(&id, resource.resource_version(), e))?;
        counter!("kube_writes_total", 1u64);
        to_resource(self.kind, updated)
    }

    async fn update_status(&self, id: &ResourceId, resource_version: &str, status: Status) -> Result<Resource, StoreError> {
        let mut body = serde_json::json!({
            "apiVersion": self.kind.api_version(),
            "kind": self.kind.as_str(),
            "metadata": { "name": id.name, "namespace": id.namespace, "resourceVersion": resource_version },
        });
        body["status"] = serde_json::to_value(&status).map_err(|e| StoreError::Backend(e.to_string()))?;
        let data = serde_json::to_vec(&body).map_err(|e| StoreError::Backend(e.to_string()))?;
        let updated = self
            .api(&id.namespace)
            .replace_status(&id.name, &PostParams::default(), data)
            .await
            .map_err(|e| map_err(id, resource_version, e))?;
        counter!("kube_writes_total", 1u64);
        to_resource(self.kind, updated)
    }

    async fn delete(&self, namespace: &str, name: &str, resource_version: Option<&str>) -> Result<(), StoreError> {
        let id = ResourceId::new(self.kind, namespace, name);
        let dp = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions { resource_version: Some(rv.to_string()), uid: None }),
            ..Default::default()
        };
        self.api(namespace)
            .delete(name, &dp)
            .await
            .map_err(|e| map_err(&id, resource_version.unwrap_or_default(), e))?;
        counter!("kube_writes_total", 1u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "x".into(), reason: reason.into(), code })
    }

    #[test]
    fn api_resource_uses_group_and_plural() {
        let ar = api_resource(Kind::ResolverMap);
        assert_eq!(ar.api_version, "sqoop.solo.io/v1");
        assert_eq!(ar.plural, "resolvermaps");
        assert_eq!(api_resource(Kind::Proxy).group, "gloo.solo.io");
    }

    #[test]
    fn crd_parses_into_typed_definition() {
        let crd: CustomResourceDefinition = serde_json::from_value(crd_for(Kind::Schema)).unwrap();
        assert_eq!(crd.metadata.name.as_deref(), Some("schemas.sqoop.solo.io"));
        assert_eq!(crd.spec.names.kind, "Schema");
        assert!(crd.spec.versions[0].subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    }

    #[test]
    fn dynamic_round_trip_keeps_spec_labels_version_and_status() {
        let ar = api_resource(Kind::Schema);
        let mut r = Resource::new(Kind::Schema, "ns1", "s1", serde_json::json!({ "inlineSchema": "type Query { a: Int }" }))
            .with_label("team", "a");
        r.metadata.resource_version = "42".into();
        r.status = Some(Status::accepted("sqoop"));
        let back = to_resource(Kind::Schema, to_dynamic(&ar, &r)).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn foreign_status_shape_is_ignored() {
        let ar = api_resource(Kind::Proxy);
        let mut obj = DynamicObject::new("p", &ar).within("gloo-system").data(serde_json::json!({ "spec": {} }));
        obj.data["status"] = serde_json::json!({ "state": 1 });
        let r = to_resource(Kind::Proxy, obj).unwrap();
        assert!(r.status.is_none());
    }

    #[test]
    fn api_errors_map_to_store_errors() {
        let id = ResourceId::new(Kind::Proxy, "ns", "p");
        assert!(map_err(&id, "1", api_err(409, "Conflict")).is_conflict());
        assert_eq!(map_err(&id, "", api_err(409, "AlreadyExists")), StoreError::AlreadyExists(id.clone()));
        assert_eq!(map_err(&id, "", api_err(404, "NotFound")), StoreError::NotFound(id.clone()));
        assert!(matches!(map_err(&id, "", api_err(500, "InternalError")), StoreError::Backend(_)));
    }

    #[test]
    fn selector_renders_sorted_pairs() {
        let opts = ListOpts::default().with_label("created_by", "sqoop").with_label("app", "x");
        assert_eq!(selector_string(&opts).as_deref(), Some("app=x,created_by=sqoop"));
        assert_eq!(selector_string(&ListOpts::default()), None);
    }
}
