//! Sqoop core types: resources, snapshots and translation results.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// The three resource kinds the loop knows about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Schema,
    ResolverMap,
    Proxy,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Schema => "Schema",
            Kind::ResolverMap => "ResolverMap",
            Kind::Proxy => "Proxy",
        }
    }

    pub fn group(&self) -> &'static str {
        match self {
            Kind::Schema | Kind::ResolverMap => "sqoop.solo.io",
            Kind::Proxy => "gloo.solo.io",
        }
    }

    pub fn version(&self) -> &'static str { "v1" }

    pub fn plural(&self) -> &'static str {
        match self {
            Kind::Schema => "schemas",
            Kind::ResolverMap => "resolvermaps",
            Kind::Proxy => "proxies",
        }
    }

    /// `group/version`, as written into `apiVersion`.
    pub fn api_version(&self) -> String { format!("{}/{}", self.group(), self.version()) }

    /// Parse from `Kind` or `group/version/Kind` form.
    pub fn parse(s: &str) -> Option<Kind> {
        let kind = s.rsplit('/').next().unwrap_or(s);
        [Kind::Schema, Kind::ResolverMap, Kind::Proxy].into_iter().find(|k| k.as_str() == kind)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Identity of a resource: (kind, namespace, name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    pub namespace: String,
    /// Opaque optimistic-concurrency token. Empty means "not yet stored".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

/// Status sub-record written back onto input resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub reported_by: String,
}

impl Status {
    pub fn accepted(reporter: &str) -> Self {
        Self { state: State::Accepted, reason: None, reported_by: reporter.to_string() }
    }

    pub fn rejected(reporter: &str, reason: impl Into<String>) -> Self {
        Self { state: State::Rejected, reason: Some(reason.into()), reported_by: reporter.to_string() }
    }
}

/// A named, namespaced, versioned record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub kind: Kind,
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl Resource {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>, spec: serde_json::Value) -> Self {
        Self {
            kind,
            metadata: Metadata { name: name.into(), namespace: namespace.into(), ..Default::default() },
            spec,
            status: None,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.kind, self.metadata.namespace.clone(), self.metadata.name.clone())
    }

    pub fn resource_version(&self) -> &str { &self.metadata.resource_version }

    /// True when every label in `selector` is present with the same value.
    pub fn matches(&self, selector: &BTreeMap<String, String>) -> bool {
        selector.iter().all(|(k, v)| self.metadata.labels.get(k) == Some(v))
    }
}

/// Immutable aggregate of every watched input resource at one logical instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub epoch: u64,
    pub schemas: BTreeMap<ResourceId, Resource>,
    pub resolver_maps: BTreeMap<ResourceId, Resource>,
    /// Watched (kind, namespace) pairs that have never listed. Their
    /// resources are unknown, not absent.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unsynced: BTreeSet<(Kind, String)>,
}

impl Snapshot {
    pub fn len(&self) -> usize { self.schemas.len() + self.resolver_maps.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// True once every watched pair has listed at least once.
    pub fn is_complete(&self) -> bool { self.unsynced.is_empty() }
}

/// Per-input translation outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected(String),
}

impl Outcome {
    pub fn to_status(&self, reporter: &str) -> Status {
        match self {
            Outcome::Accepted => Status::accepted(reporter),
            Outcome::Rejected(reason) => Status::rejected(reporter, reason.clone()),
        }
    }

    pub fn is_accepted(&self) -> bool { matches!(self, Outcome::Accepted) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acceptance {
    pub id: ResourceId,
    /// Version of the input the outcome was computed from.
    pub resource_version: String,
    /// Status as observed in the snapshot, used to skip no-op writes.
    pub observed: Option<Status>,
    pub outcome: Outcome,
}

/// A compiled GraphQL endpoint, served by the router.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub namespace: String,
    pub name: String,
    pub path: String,
    pub sdl: String,
    pub types: Vec<String>,
    /// Resolver definitions keyed by `Type.field`.
    pub resolvers: BTreeMap<String, serde_json::Value>,
}

/// Translator output for one snapshot. Never retained across passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DerivedConfig {
    pub proxies: Vec<Resource>,
    pub acceptance: Vec<Acceptance>,
    pub endpoints: Vec<Endpoint>,
}

impl DerivedConfig {
    pub fn outcome_of(&self, id: &ResourceId) -> Option<&Outcome> {
        self.acceptance.iter().find(|a| &a.id == id).map(|a| &a.outcome)
    }

    pub fn rejected(&self) -> impl Iterator<Item = &Acceptance> {
        self.acceptance.iter().filter(|a| !a.outcome.is_accepted())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ReconcileSummary {
    pub fn writes(&self) -> usize { self.created + self.updated + self.deleted }
}

/// Outcome of applying desired output resources to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileResult {
    Converged(ReconcileSummary),
    /// Version precondition failed; writes before the conflict stay applied.
    Conflict { id: ResourceId, partial: ReconcileSummary },
    Failed(StoreError),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("kind {0} is not registered")]
    NotRegistered(Kind),
    #[error("{0} not found")]
    NotFound(ResourceId),
    #[error("{0} already exists")]
    AlreadyExists(ResourceId),
    #[error("conflict on {id}: expected resource version {expected:?}, found {actual:?}")]
    Conflict { id: ResourceId, expected: String, actual: String },
    #[error("invalid resource {id}: {reason}")]
    Invalid { id: ResourceId, reason: String },
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}
