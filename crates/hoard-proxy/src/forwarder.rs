use crate::error::ProxyError;
use crate::response::is_hop_by_hop;
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::time::Duration;

pub type HttpClient = Client<HttpConnector, Body>;

/// Default upper bound on one origin exchange, head and body together.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A request to send to the origin.
pub struct OriginRequest {
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Body,
}

/// A fully-read origin response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Upstream the proxy fetches from.
///
/// Any status the origin answers with is a successful fetch; only transport
/// failures, timeouts and unreadable bodies are errors.
pub trait Origin: Send + Sync + 'static {
    fn fetch(
        &self,
        request: OriginRequest,
    ) -> impl Future<Output = Result<OriginResponse, ProxyError>> + Send;
}

/// Origin reached over plain HTTP with hyper's pooled client.
pub struct HyperOrigin {
    client: HttpClient,
    base_url: String,
    timeout: Duration,
}

impl HyperOrigin {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn upstream_request(&self, request: OriginRequest) -> Result<Request<Body>, ProxyError> {
        let upstream_uri = format!("{}{}", self.base_url, request.path_and_query);
        let mut builder = Request::builder().method(request.method).uri(&upstream_uri);
        for (name, value) in request.headers.iter() {
            if is_hop_by_hop(name) || name == header::HOST {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder
            .body(request.body)
            .map_err(|e| ProxyError::InvalidUpstreamRequest(e.to_string()))
    }

    async fn exchange(&self, upstream: Request<Body>) -> Result<OriginResponse, ProxyError> {
        let response = self
            .client
            .request(upstream)
            .await
            .map_err(|e| ProxyError::OriginUnavailable(e.to_string()))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::OriginBodyRead(e.to_string()))?
            .to_bytes();

        Ok(OriginResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

impl Origin for HyperOrigin {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse, ProxyError> {
        let upstream = self.upstream_request(request)?;
        let uri = upstream.uri().clone();

        match tokio::time::timeout(self.timeout, self.exchange(upstream)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, upstream = %uri, "origin fetch failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(upstream = %uri, timeout_ms = self.timeout.as_millis() as u64, "origin fetch timed out");
                Err(ProxyError::OriginUnavailable(format!(
                    "no complete response within {:?}",
                    self.timeout
                )))
            }
        }
    }
}
