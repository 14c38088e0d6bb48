use axum::body::Body;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::Response;
use hoard_cache::CacheEntry;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

// `Keep-Alive` and `Trailers` have no constant in `http::header`.
const KEEP_ALIVE: HeaderName = HeaderName::from_static("keep-alive");
const TRAILERS: HeaderName = HeaderName::from_static("trailers");

/// Headers that only mean something for a single connection.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    KEEP_ALIVE,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    TRAILERS,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name)
}

/// How a response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Build the client response: origin status, origin headers minus the
/// hop-by-hop set, `X-Cache` with our label, then the body.
pub fn write_response(entry: &CacheEntry, status: CacheStatus) -> Response<Body> {
    let mut response = Response::new(Body::from(entry.body.clone()));
    *response.status_mut() = entry.status;

    let headers = response.headers_mut();
    for (name, value) in entry.headers.iter() {
        if is_hop_by_hop(name) || name == X_CACHE {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(X_CACHE, HeaderValue::from_static(status.as_str()));

    response
}
