use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use hoard_cache::FetchAborted;
use std::net::SocketAddr;

/// Failures surfaced to a client while serving a proxied request.
///
/// `Clone` because a failed coalesced fetch is handed to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    /// Connection refused, DNS failure or timeout.
    #[error("origin unavailable: {0}")]
    OriginUnavailable(String),

    #[error("could not build upstream request: {0}")]
    InvalidUpstreamRequest(String),

    /// The origin answered but the body could not be read in full.
    #[error("failed to read origin body: {0}")]
    OriginBodyRead(String),

    #[error(transparent)]
    FetchAborted(#[from] FetchAborted),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::OriginUnavailable(_) | ProxyError::InvalidUpstreamRequest(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::OriginBodyRead(_) | ProxyError::FetchAborted(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response<Body> {
        let status = self.status();
        let message = match status {
            StatusCode::BAD_GATEWAY => "Bad Gateway",
            _ => "Internal Server Error",
        };
        (status, message).into_response()
    }
}

/// Problems loading or validating the proxy configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no origin configured: pass --origin or set upstream.url")]
    MissingOrigin,

    #[error("invalid origin url {url:?}: {reason}")]
    InvalidOrigin { url: String, reason: String },

    #[error("invalid listen address {addr:?}: {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    #[error("cache capacity must be greater than zero")]
    ZeroCapacity,
}

/// Failures of `--clear-cache` talking to a running instance.
#[derive(Debug, thiserror::Error)]
pub enum ClearError {
    #[error("could not reach admin endpoint {addr}: {reason}")]
    Unreachable { addr: SocketAddr, reason: String },

    #[error("admin endpoint {0} did not answer in time")]
    Timeout(SocketAddr),

    #[error("admin endpoint answered {0}")]
    Status(StatusCode),

    #[error("unexpected admin response: {0}")]
    Decode(String),
}
