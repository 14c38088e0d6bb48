use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use std::fmt;
use std::time::Instant;

/// Cache key derived from the request method and path-and-query: `METHOD:URL`.
///
/// Two requests with the same method and URL always produce the same
/// fingerprint. It is the only thing lookup, eviction and coalescing group on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(method: &Method, uri: &Uri) -> Self {
        let url = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        Fingerprint(format!("{method}:{url}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Fingerprint(value.to_string())
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Fingerprint(value)
    }
}

/// A fully-read origin response held by the store.
///
/// Entries are shared as `Arc<CacheEntry>` and never mutated; a refresh
/// replaces the whole entry.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: Fingerprint,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub created_at: Instant,
}

impl CacheEntry {
    /// Build an entry stamped with the current instant.
    pub fn new(key: Fingerprint, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            key,
            status,
            headers,
            body,
            created_at: Instant::now(),
        }
    }

    /// Age of the entry relative to `now`. Zero if `now` precedes creation.
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.created_at)
    }
}
