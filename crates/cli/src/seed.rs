//! YAML manifest loading for the in-memory backend and `sqoop check`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use sqoop_core::{Kind, Resource, Snapshot};
use sqoop_store::{MemoryStore, ResourceClient, SnapshotBuilder};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    api_version: String,
    kind: String,
    metadata: ManifestMeta,
    #[serde(default)]
    spec: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ManifestMeta {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// Parse a (possibly multi-document) YAML string.
pub fn parse_manifests(src: &str, default_ns: &str) -> Result<Vec<Resource>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(src).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {}", i))?;
        if value.is_null() {
            continue;
        }
        let m: Manifest = serde_yaml::from_value(value).with_context(|| format!("document {}", i))?;
        let kind = Kind::parse(&m.kind).ok_or_else(|| anyhow!("document {}: unknown kind {:?}", i, m.kind))?;
        if !m.api_version.is_empty() && m.api_version != kind.api_version() {
            bail!("document {}: {} expects apiVersion {}, got {}", i, kind, kind.api_version(), m.api_version);
        }
        let ns = m.metadata.namespace.filter(|ns| !ns.is_empty()).unwrap_or_else(|| default_ns.to_string());
        let mut r = Resource::new(kind, ns, m.metadata.name, m.spec);
        r.metadata.labels = m.metadata.labels;
        out.push(r);
    }
    Ok(out)
}

/// Load every `.yaml`/`.yml` file in `dir`, in file-name order.
pub fn load_dir(dir: &Path, default_ns: &str) -> Result<Vec<Resource>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml")))
        .collect();
    paths.sort();
    let mut out = Vec::new();
    for p in paths {
        let src = std::fs::read_to_string(&p).with_context(|| format!("reading {}", p.display()))?;
        out.extend(parse_manifests(&src, default_ns).with_context(|| format!("parsing {}", p.display()))?);
    }
    Ok(out)
}

/// Create every resource in the store, registering kinds as needed.
pub async fn seed_store(store: &MemoryStore, resources: Vec<Resource>) -> Result<usize> {
    let mut clients: BTreeMap<Kind, Arc<dyn ResourceClient>> = BTreeMap::new();
    let mut n = 0usize;
    for r in resources {
        let client = match clients.get(&r.kind) {
            Some(c) => c.clone(),
            None => {
                let c: Arc<dyn ResourceClient> = Arc::new(store.client(r.kind));
                c.register().await.with_context(|| format!("registering {}", r.kind))?;
                clients.insert(r.kind, c.clone());
                c
            }
        };
        let id = r.id();
        client.create(r).await.with_context(|| format!("seeding {}", id))?;
        n += 1;
    }
    Ok(n)
}

/// Freeze a one-off snapshot from loose resources.
pub fn snapshot_of(resources: Vec<Resource>) -> Arc<Snapshot> {
    let mut lists: BTreeMap<(Kind, String), Vec<Resource>> = BTreeMap::new();
    for r in resources {
        lists.entry((r.kind, r.metadata.namespace.clone())).or_default().push(r);
    }
    let mut builder = SnapshotBuilder::new();
    for ((kind, ns), items) in lists {
        builder.apply(kind, &ns, items);
    }
    builder.freeze()
}
