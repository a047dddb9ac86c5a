//! Sqoop router: HTTP view over the live endpoint table.
//!
//! The table is swapped wholesale after every successful translation; readers
//! never block the sync loop.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Serialize;
use sqoop_core::Endpoint;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

type Table = BTreeMap<(String, String), Endpoint>;

/// Shared, lock-free endpoint table keyed by (namespace, name).
#[derive(Clone, Default)]
pub struct EndpointTable {
    inner: Arc<ArcSwap<Table>>,
}

impl EndpointTable {
    pub fn new() -> Self { Self::default() }

    /// Replace the whole table.
    pub fn publish(&self, endpoints: Vec<Endpoint>) {
        let next: Table = endpoints.into_iter().map(|e| ((e.namespace.clone(), e.name.clone()), e)).collect();
        self.inner.store(Arc::new(next));
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Endpoint> {
        self.inner.load().get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn len(&self) -> usize { self.inner.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn current(&self) -> Arc<Table> { self.inner.load_full() }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("binding {addr}: {source}")]
    Bind { addr: SocketAddr, source: std::io::Error },
    #[error("serving: {0}")]
    Serve(std::io::Error),
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    endpoints: usize,
}

#[derive(Debug, Serialize)]
struct EndpointSummary {
    namespace: String,
    name: String,
    path: String,
    types: Vec<String>,
    resolvers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error(code: StatusCode, msg: impl Into<String>) -> Response {
    (code, Json(ErrorBody { error: msg.into() })).into_response()
}

async fn healthz(State(table): State<EndpointTable>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION"), endpoints: table.len() })
}

async fn list_endpoints(State(table): State<EndpointTable>) -> Json<Vec<EndpointSummary>> {
    let out = table
        .current()
        .values()
        .map(|e| EndpointSummary {
            namespace: e.namespace.clone(),
            name: e.name.clone(),
            path: e.path.clone(),
            types: e.types.clone(),
            resolvers: e.resolvers.keys().cloned().collect(),
        })
        .collect();
    Json(out)
}

async fn get_schema(State(table): State<EndpointTable>, Path((namespace, name)): Path<(String, String)>) -> Response {
    match table.get(&namespace, &name) {
        Some(e) => e.sdl.into_response(),
        None => error(StatusCode::NOT_FOUND, format!("no endpoint {}.{}", namespace, name)),
    }
}

async fn query(State(table): State<EndpointTable>, Path((namespace, name)): Path<(String, String)>) -> Response {
    match table.get(&namespace, &name) {
        Some(e) => error(
            StatusCode::NOT_IMPLEMENTED,
            format!("queries for {} are executed by the sidecar behind the proxy route", e.path),
        ),
        None => error(StatusCode::NOT_FOUND, format!("no endpoint {}.{}", namespace, name)),
    }
}

pub struct Router {
    table: EndpointTable,
}

impl Router {
    pub fn new(table: EndpointTable) -> Self { Self { table } }

    pub fn app(&self) -> axum::Router {
        axum::Router::new()
            .route("/healthz", get(healthz))
            .route("/endpoints", get(list_endpoints))
            .route("/{namespace}/{name}/schema", get(get_schema))
            .route("/{namespace}/{name}/graphql", post(query))
            .with_state(self.table.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until the listener fails.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), RouterError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| RouterError::Bind { addr, source })?;
        info!(addr = %addr, "router listening");
        axum::serve(listener, self.app()).await.map_err(RouterError::Serve)
    }
}
