//! Sqoop engine: translates a snapshot of schemas and resolver maps into the
//! desired gateway proxy, per-input acceptance results and the compiled
//! endpoint table served by the router.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqoop_core::{Acceptance, DerivedConfig, Endpoint, Kind, Outcome, Resource, ResourceId, Snapshot};
use tracing::debug;

pub mod sdl;

pub use sdl::SchemaDoc;

/// Pure function from a snapshot to derived configuration.
///
/// Per-input problems are reported as rejected outcomes; `Err` is reserved for
/// failures that make the whole snapshot untranslatable.
pub trait Translator: Send + Sync {
    fn translate(&self, snapshot: &Snapshot) -> Result<DerivedConfig, TranslateError>;
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("inconsistent snapshot: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSpec {
    pub inline_schema: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TypeResolver {
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverMapSpec {
    pub schema: SchemaRef,
    #[serde(default)]
    pub types: BTreeMap<String, TypeResolver>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub write_namespace: String,
    /// Written into `reportedBy` on every status.
    pub reporter: String,
    pub proxy_name: String,
    pub bind_address: String,
    pub bind_port: u16,
    /// Where queries are forwarded for execution.
    pub sidecar_addr: String,
}

impl EngineConfig {
    pub fn new(write_namespace: impl Into<String>, sidecar_addr: impl Into<String>) -> Self {
        Self {
            write_namespace: write_namespace.into(),
            reporter: "sqoop".into(),
            proxy_name: "sqoop".into(),
            bind_address: "::".into(),
            bind_port: 8080,
            sidecar_addr: sidecar_addr.into(),
        }
    }
}

pub struct Engine {
    cfg: EngineConfig,
}

struct CompiledSchema {
    doc: SchemaDoc,
    sdl: String,
    /// `Type.field` -> (resolver, owning resolver map)
    resolvers: BTreeMap<String, (serde_json::Value, ResourceId)>,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self { Self { cfg } }

    pub fn config(&self) -> &EngineConfig { &self.cfg }

    fn compile_schema(r: &Resource) -> Result<(SchemaDoc, String), String> {
        let spec: SchemaSpec = serde_json::from_value(r.spec.clone()).map_err(|e| format!("invalid spec: {}", e))?;
        let doc = sdl::scan(&spec.inline_schema).map_err(|e| format!("invalid schema: {}", e))?;
        Ok((doc, spec.inline_schema))
    }

    fn endpoint_path(id: &ResourceId) -> String { format!("/{}/{}/graphql", id.namespace, id.name) }

    fn proxy(&self, endpoints: &[Endpoint]) -> Resource {
        let routes: Vec<serde_json::Value> = endpoints
            .iter()
            .map(|e| {
                serde_json::json!({
                    "prefix": e.path,
                    "sidecar": self.cfg.sidecar_addr,
                    "schema": format!("{}.{}", e.namespace, e.name),
                })
            })
            .collect();
        Resource::new(
            Kind::Proxy,
            self.cfg.write_namespace.clone(),
            self.cfg.proxy_name.clone(),
            serde_json::json!({
                "listeners": [{
                    "name": "sqoop-listener",
                    "bindAddress": self.cfg.bind_address,
                    "bindPort": self.cfg.bind_port,
                    "routes": routes,
                }]
            }),
        )
    }
}

fn check_consistent(snapshot: &Snapshot) -> Result<(), TranslateError> {
    let groups = [(Kind::Schema, &snapshot.schemas), (Kind::ResolverMap, &snapshot.resolver_maps)];
    for (kind, items) in groups {
        for (id, r) in items.iter() {
            if id.kind != kind || r.id() != *id {
                return Err(TranslateError::Inconsistent(format!("{} indexed under {}", r.id(), id)));
            }
        }
    }
    Ok(())
}

/// Exactly one known variant per resolver.
pub fn validate_resolver(v: &serde_json::Value) -> Result<(), String> {
    let obj = v.as_object().ok_or_else(|| "resolver must be an object".to_string())?;
    let variants: Vec<&str> = ["template", "upstream", "node"].into_iter().filter(|k| obj.contains_key(*k)).collect();
    match variants.as_slice() {
        [] => Err("expected one of template, upstream, node".into()),
        ["template"] => match obj.get("template") {
            Some(serde_json::Value::String(_)) => Ok(()),
            _ => Err("template must be a string".into()),
        },
        ["upstream"] => match obj.get("upstream").and_then(|u| u.get("name")) {
            Some(serde_json::Value::String(n)) if !n.is_empty() => Ok(()),
            _ => Err("upstream.name is required".into()),
        },
        ["node"] => match obj.get("node").and_then(|n| n.get("request")) {
            Some(_) => Ok(()),
            None => Err("node.request is required".into()),
        },
        many => Err(format!("multiple resolver variants: {}", many.join(", "))),
    }
}

impl Translator for Engine {
    fn translate(&self, snapshot: &Snapshot) -> Result<DerivedConfig, TranslateError> {
        check_consistent(snapshot)?;
        let mut acceptance = Vec::with_capacity(snapshot.len());
        let mut compiled: BTreeMap<ResourceId, CompiledSchema> = BTreeMap::new();
        let mut rejected_schemas: BTreeMap<ResourceId, String> = BTreeMap::new();

        for (id, r) in snapshot.schemas.iter() {
            let outcome = match Self::compile_schema(r) {
                Ok((doc, sdl)) => {
                    compiled.insert(id.clone(), CompiledSchema { doc, sdl, resolvers: BTreeMap::new() });
                    Outcome::Accepted
                }
                Err(reason) => {
                    rejected_schemas.insert(id.clone(), reason.clone());
                    Outcome::Rejected(reason)
                }
            };
            acceptance.push(Acceptance {
                id: id.clone(),
                resource_version: r.metadata.resource_version.clone(),
                observed: r.status.clone(),
                outcome,
            });
        }

        for (id, r) in snapshot.resolver_maps.iter() {
            let outcome = match bind_resolver_map(id, r, &mut compiled, &rejected_schemas) {
                Ok(()) => Outcome::Accepted,
                Err(reason) => Outcome::Rejected(reason),
            };
            acceptance.push(Acceptance {
                id: id.clone(),
                resource_version: r.metadata.resource_version.clone(),
                observed: r.status.clone(),
                outcome,
            });
        }

        let endpoints: Vec<Endpoint> = compiled
            .into_iter()
            .map(|(id, c)| Endpoint {
                path: Self::endpoint_path(&id),
                namespace: id.namespace,
                name: id.name,
                sdl: c.sdl,
                types: c.doc.types.keys().cloned().collect(),
                resolvers: c.resolvers.into_iter().map(|(k, (v, _))| (k, v)).collect(),
            })
            .collect();
        let proxies = if endpoints.is_empty() { Vec::new() } else { vec![self.proxy(&endpoints)] };
        debug!(
            epoch = snapshot.epoch,
            endpoints = endpoints.len(),
            rejected = acceptance.iter().filter(|a| !a.outcome.is_accepted()).count(),
            "engine: snapshot translated"
        );
        Ok(DerivedConfig { proxies, acceptance, endpoints })
    }
}

/// Validate a resolver map against its schema and bind its resolvers.
/// Nothing is bound unless the whole map is valid.
fn bind_resolver_map(
    id: &ResourceId,
    r: &Resource,
    compiled: &mut BTreeMap<ResourceId, CompiledSchema>,
    rejected_schemas: &BTreeMap<ResourceId, String>,
) -> Result<(), String> {
    let spec: ResolverMapSpec = serde_json::from_value(r.spec.clone()).map_err(|e| format!("invalid spec: {}", e))?;
    let schema_ns = spec.schema.namespace.clone().unwrap_or_else(|| id.namespace.clone());
    let schema_id = ResourceId::new(Kind::Schema, schema_ns, spec.schema.name.clone());
    if rejected_schemas.contains_key(&schema_id) {
        return Err(format!("schema {}.{} is rejected", schema_id.namespace, schema_id.name));
    }
    let target = compiled
        .get_mut(&schema_id)
        .ok_or_else(|| format!("missing schema {}.{}", schema_id.namespace, schema_id.name))?;

    let mut bound = Vec::new();
    for (ty, tr) in spec.types.iter() {
        if !target.doc.has_type(ty) {
            return Err(format!("unknown type {}", ty));
        }
        for (field, resolver) in tr.fields.iter() {
            if !target.doc.has_field(ty, field) {
                return Err(format!("unknown field {}.{}", ty, field));
            }
            validate_resolver(resolver).map_err(|e| format!("invalid resolver for {}.{}: {}", ty, field, e))?;
            let key = format!("{}.{}", ty, field);
            if let Some((_, owner)) = target.resolvers.get(&key) {
                return Err(format!("field {} already resolved by {}.{}", key, owner.namespace, owner.name));
            }
            bound.push((key, resolver.clone()));
        }
    }
    for (key, resolver) in bound {
        target.resolvers.insert(key, (resolver, id.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqoop_core::{State, Status};

    const PETS: &str = "type Query { pets: [Pet] pet(id: ID!): Pet } type Pet { id: ID! name: String }";

    fn engine() -> Engine { Engine::new(EngineConfig::new("gloo-system", "127.0.0.1:9096")) }

    fn schema(ns: &str, name: &str, sdl: &str) -> Resource {
        let mut r = Resource::new(Kind::Schema, ns, name, serde_json::json!({ "inlineSchema": sdl }));
        r.metadata.resource_version = "1".into();
        r
    }

    fn resolver_map(ns: &str, name: &str, spec: serde_json::Value) -> Resource {
        let mut r = Resource::new(Kind::ResolverMap, ns, name, spec);
        r.metadata.resource_version = "2".into();
        r
    }

    fn snapshot(items: Vec<Resource>) -> Snapshot {
        let mut s = Snapshot { epoch: 1, ..Default::default() };
        for r in items {
            match r.kind {
                Kind::Schema => s.schemas.insert(r.id(), r),
                _ => s.resolver_maps.insert(r.id(), r),
            };
        }
        s
    }

    fn pets_resolvers(schema: &str) -> serde_json::Value {
        serde_json::json!({
            "schema": { "name": schema },
            "types": { "Query": { "fields": {
                "pets": { "upstream": { "name": "petstore", "function": "list" } },
                "pet": { "template": "{{ id }}" }
            } } }
        })
    }

    #[test]
    fn valid_inputs_produce_proxy_and_endpoint() {
        let snap = snapshot(vec![schema("ns1", "s1", PETS), resolver_map("ns1", "r1", pets_resolvers("s1"))]);
        let out = engine().translate(&snap).unwrap();
        assert_eq!(out.proxies.len(), 1);
        let proxy = &out.proxies[0];
        assert_eq!(proxy.id(), ResourceId::new(Kind::Proxy, "gloo-system", "sqoop"));
        assert_eq!(proxy.spec["listeners"][0]["routes"][0]["prefix"], "/ns1/s1/graphql");
        assert_eq!(proxy.spec["listeners"][0]["routes"][0]["sidecar"], "127.0.0.1:9096");
        assert_eq!(out.endpoints.len(), 1);
        assert_eq!(out.endpoints[0].resolvers.len(), 2);
        assert_eq!(out.rejected().count(), 0);
        let a = out.acceptance.iter().find(|a| a.id.kind == Kind::ResolverMap).unwrap();
        assert_eq!(a.resource_version, "2");
    }

    #[test]
    fn resolver_map_without_schema_is_rejected_while_others_translate() {
        let snap = snapshot(vec![
            schema("ns1", "s2", PETS),
            resolver_map("ns1", "r1", pets_resolvers("s1")),
            resolver_map("ns1", "r2", pets_resolvers("s2")),
        ]);
        let out = engine().translate(&snap).unwrap();
        assert_eq!(
            out.outcome_of(&ResourceId::new(Kind::ResolverMap, "ns1", "r1")),
            Some(&Outcome::Rejected("missing schema ns1.s1".into()))
        );
        assert_eq!(out.outcome_of(&ResourceId::new(Kind::ResolverMap, "ns1", "r2")), Some(&Outcome::Accepted));
        assert_eq!(out.proxies.len(), 1);
    }

    #[test]
    fn resolver_validation_reasons() {
        let cases = vec![
            (serde_json::json!({ "schema": { "name": "s1" }, "types": { "Mutation": {} } }), "unknown type Mutation"),
            (
                serde_json::json!({ "schema": { "name": "s1" }, "types": { "Pet": { "fields": { "age": { "template": "x" } } } } }),
                "unknown field Pet.age",
            ),
            (
                serde_json::json!({ "schema": { "name": "s1" }, "types": { "Pet": { "fields": { "name": { "template": "x", "node": {} } } } } }),
                "invalid resolver for Pet.name: multiple resolver variants: template, node",
            ),
            (serde_json::json!({ "types": {} }), "invalid spec"),
        ];
        for (spec, want) in cases {
            let snap = snapshot(vec![schema("ns1", "s1", PETS), resolver_map("ns1", "r", spec)]);
            let out = engine().translate(&snap).unwrap();
            match out.outcome_of(&ResourceId::new(Kind::ResolverMap, "ns1", "r")) {
                Some(Outcome::Rejected(reason)) => assert!(reason.starts_with(want), "{reason} vs {want}"),
                other => panic!("expected rejection, got {:?}", other),
            }
        }
    }

    #[test]
    fn invalid_schema_rejects_dependents_and_yields_no_proxy() {
        let snap = snapshot(vec![schema("ns1", "s1", "type Query {"), resolver_map("ns1", "r1", pets_resolvers("s1"))]);
        let out = engine().translate(&snap).unwrap();
        assert!(out.proxies.is_empty());
        assert!(matches!(
            out.outcome_of(&ResourceId::new(Kind::Schema, "ns1", "s1")),
            Some(Outcome::Rejected(r)) if r.starts_with("invalid schema")
        ));
        assert_eq!(
            out.outcome_of(&ResourceId::new(Kind::ResolverMap, "ns1", "r1")),
            Some(&Outcome::Rejected("schema ns1.s1 is rejected".into()))
        );
    }

    #[test]
    fn second_map_resolving_the_same_field_is_rejected() {
        let snap = snapshot(vec![
            schema("ns1", "s1", PETS),
            resolver_map("ns1", "a", pets_resolvers("s1")),
            resolver_map("ns1", "b", pets_resolvers("s1")),
        ]);
        let out = engine().translate(&snap).unwrap();
        assert_eq!(out.outcome_of(&ResourceId::new(Kind::ResolverMap, "ns1", "a")), Some(&Outcome::Accepted));
        assert!(matches!(
            out.outcome_of(&ResourceId::new(Kind::ResolverMap, "ns1", "b")),
            Some(Outcome::Rejected(r)) if r.contains("already resolved by ns1.a")
        ));
    }

    #[test]
    fn cross_namespace_schema_reference() {
        let spec = serde_json::json!({ "schema": { "name": "s1", "namespace": "ns1" }, "types": {} });
        let snap = snapshot(vec![schema("ns1", "s1", PETS), resolver_map("ns2", "r", spec)]);
        let out = engine().translate(&snap).unwrap();
        assert_eq!(out.outcome_of(&ResourceId::new(Kind::ResolverMap, "ns2", "r")), Some(&Outcome::Accepted));
    }

    #[test]
    fn observed_status_is_carried_through() {
        let mut s = schema("ns1", "s1", PETS);
        s.status = Some(Status { state: State::Accepted, reason: None, reported_by: "sqoop".into() });
        let out = engine().translate(&snapshot(vec![s])).unwrap();
        assert_eq!(out.acceptance[0].observed, Some(Status::accepted("sqoop")));
    }

    #[test]
    fn inconsistent_snapshot_fails_whole_call() {
        let mut snap = snapshot(vec![schema("ns1", "s1", PETS)]);
        let stray = schema("ns1", "other", PETS);
        snap.schemas.insert(ResourceId::new(Kind::Schema, "ns1", "wrong"), stray);
        assert!(matches!(engine().translate(&snap), Err(TranslateError::Inconsistent(_))));
    }

    #[test]
    fn resolver_variants() {
        assert!(validate_resolver(&serde_json::json!({ "template": "x" })).is_ok());
        assert!(validate_resolver(&serde_json::json!({ "upstream": { "name": "u" } })).is_ok());
        assert!(validate_resolver(&serde_json::json!({ "node": { "request": {} } })).is_ok());
        assert!(validate_resolver(&serde_json::json!({ "template": 1 })).is_err());
        assert!(validate_resolver(&serde_json::json!({ "upstream": {} })).is_err());
        assert!(validate_resolver(&serde_json::json!("x")).is_err());
        assert!(validate_resolver(&serde_json::json!({})).is_err());
    }
}
