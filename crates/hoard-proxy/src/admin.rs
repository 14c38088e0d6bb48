use crate::error::ClearError;
use crate::forwarder::{HttpClient, Origin};
use crate::proxy::Dispatcher;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub const CLEAR_PATH: &str = "/api/cache/clear";
const CLEAR_TIMEOUT: Duration = Duration::from_secs(5);

/// State for the admin router.
pub struct AdminState<O: Origin> {
    pub dispatcher: Arc<Dispatcher<O>>,
    pub prometheus: Option<PrometheusHandle>,
}

impl<O: Origin> Clone for AdminState<O> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            prometheus: self.prometheus.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub cleared: usize,
}

pub fn router<O: Origin>(state: AdminState<O>) -> Router {
    Router::new()
        .route(CLEAR_PATH, post(clear_handler::<O>))
        .route("/api/stats", get(stats_handler::<O>))
        .route("/metrics", get(metrics_handler::<O>))
        .with_state(state)
}

/// POST /api/cache/clear: drop every cached entry.
async fn clear_handler<O: Origin>(State(state): State<AdminState<O>>) -> Json<ClearResponse> {
    let cleared = state.dispatcher.clear_cache();
    metrics::counter!("hoard_cache_cleared_total").increment(1);
    Json(ClearResponse { cleared })
}

/// GET /api/stats: one-shot stats endpoint.
async fn stats_handler<O: Origin>(State(state): State<AdminState<O>>) -> impl IntoResponse {
    Json(state.dispatcher.stats())
}

/// GET /metrics: Prometheus exposition.
async fn metrics_handler<O: Origin>(State(state): State<AdminState<O>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::NOT_FOUND,
            "metrics recorder not installed".to_string(),
        ),
    }
}

/// Ask a running instance to clear its cache through its admin listener.
pub async fn request_clear(admin_addr: SocketAddr) -> Result<ClearResponse, ClearError> {
    let client: HttpClient = Client::builder(TokioExecutor::new()).build_http();
    let target = reachable(admin_addr);
    let cannot_reach = |reason: String| ClearError::Unreachable {
        addr: target,
        reason,
    };
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{target}{CLEAR_PATH}"))
        .body(Body::empty())
        .map_err(|e| cannot_reach(e.to_string()))?;

    let response = tokio::time::timeout(CLEAR_TIMEOUT, client.request(req))
        .await
        .map_err(|_| ClearError::Timeout(target))?
        .map_err(|e| cannot_reach(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ClearError::Status(status));
    }
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| ClearError::Decode(e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| ClearError::Decode(e.to_string()))
}

// A wildcard bind address is not something a client can connect to.
fn reachable(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        let loopback = match addr {
            SocketAddr::V4(_) => std::net::Ipv4Addr::LOCALHOST.into(),
            SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
        };
        SocketAddr::new(loopback, addr.port())
    } else {
        addr
    }
}
