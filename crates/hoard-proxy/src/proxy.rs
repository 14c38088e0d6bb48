use crate::error::ProxyError;
use crate::forwarder::{Origin, OriginRequest, OriginResponse};
use crate::response::{write_response, CacheStatus};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Request, Response};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use hoard_cache::{is_fresh, CacheEntry, Coalescer, CoalescerStats, Fingerprint, LruStore, StoreStats};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

/// Tunables for the dispatch path.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub ttl: Duration,
    /// Larger responses are served but not stored.
    pub max_body_size: usize,
}

/// A response ready to be written, with the label it goes out under.
pub struct Served {
    pub entry: Arc<CacheEntry>,
    pub status: CacheStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub expired: u64,
    pub upstream_errors: u64,
    pub coalesced: u64,
    pub origin_fetches: u64,
    pub in_flight: usize,
    pub store: StoreSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub size: usize,
    pub capacity: usize,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    expired: AtomicU64,
    upstream_errors: AtomicU64,
}

/// Decides HIT, MISS or BYPASS for each request and drives the store,
/// the coalescer and the origin accordingly.
pub struct Dispatcher<O: Origin> {
    store: Arc<LruStore>,
    origin: Arc<O>,
    in_flight: Coalescer<Fingerprint, Arc<CacheEntry>, ProxyError>,
    config: DispatchConfig,
    counters: Counters,
}

impl<O: Origin> Dispatcher<O> {
    pub fn new(store: Arc<LruStore>, origin: O, config: DispatchConfig) -> Self {
        Self {
            store,
            origin: Arc::new(origin),
            in_flight: Coalescer::new(),
            config,
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<LruStore> {
        &self.store
    }

    pub async fn dispatch(&self, req: Request<Body>) -> Result<Served, ProxyError> {
        let (parts, body) = req.into_parts();
        let key = Fingerprint::new(&parts.method, &parts.uri);
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        if parts.method != Method::GET || client_forbids_caching(&parts.headers) {
            let request = OriginRequest {
                method: parts.method,
                path_and_query,
                headers: parts.headers,
                body,
            };
            return self.bypass(key, request).await;
        }

        if let Some(entry) = self.lookup(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Served {
                entry,
                status: CacheStatus::Hit,
            });
        }

        let request = OriginRequest {
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body: Body::empty(),
        };
        self.miss(key, request).await
    }

    /// Fresh entry for `key`, if any. Stale or mismatched entries are removed
    /// unless a concurrent miss has already replaced them.
    fn lookup(&self, key: &Fingerprint) -> Option<Arc<CacheEntry>> {
        let entry = self.store.get(key)?;

        if entry.key != *key {
            tracing::warn!(key = %key, stored_key = %entry.key, "cache entry under wrong key, discarding");
            self.store.remove_if(key, &entry);
            return None;
        }

        if is_fresh(&entry, Instant::now(), self.config.ttl) {
            return Some(entry);
        }

        tracing::debug!(key = %key, age_ms = entry.age(Instant::now()).as_millis() as u64, "cache entry expired");
        self.counters.expired.fetch_add(1, Ordering::Relaxed);
        self.store.remove_if(key, &entry);
        None
    }

    async fn bypass(&self, key: Fingerprint, request: OriginRequest) -> Result<Served, ProxyError> {
        self.counters.bypasses.fetch_add(1, Ordering::Relaxed);
        let response = self.origin.fetch(request).await.inspect_err(|_| {
            self.counters.upstream_errors.fetch_add(1, Ordering::Relaxed);
        })?;
        Ok(Served {
            entry: Arc::new(into_entry(key, response)),
            status: CacheStatus::Bypass,
        })
    }

    async fn miss(&self, key: Fingerprint, request: OriginRequest) -> Result<Served, ProxyError> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let store = Arc::clone(&self.store);
        let origin = Arc::clone(&self.origin);
        let max_body_size = self.config.max_body_size;
        let fetch_key = key.clone();

        let entry = self
            .in_flight
            .do_once(key, move || async move {
                let response = origin.fetch(request).await?;
                let entry = Arc::new(into_entry(fetch_key.clone(), response));
                if entry.body.len() <= max_body_size {
                    store.put(fetch_key, Arc::clone(&entry));
                } else {
                    tracing::debug!(
                        key = %fetch_key,
                        size = entry.body.len(),
                        max_body_size,
                        "response too large to cache"
                    );
                }
                Ok(entry)
            })
            .await
            .inspect_err(|_| {
                self.counters.upstream_errors.fetch_add(1, Ordering::Relaxed);
            })?;

        Ok(Served {
            entry,
            status: CacheStatus::Miss,
        })
    }

    /// Operator-triggered invalidation. Returns how many entries were dropped.
    pub fn clear_cache(&self) -> usize {
        let cleared = self.store.clear();
        tracing::info!(cleared, "cache cleared");
        cleared
    }

    pub fn stats(&self) -> DispatchStats {
        let coalescer: CoalescerStats = self.in_flight.stats();
        let store: StoreStats = self.store.stats();
        DispatchStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            upstream_errors: self.counters.upstream_errors.load(Ordering::Relaxed),
            coalesced: coalescer.followers,
            origin_fetches: coalescer.leaders,
            in_flight: coalescer.in_flight,
            store: StoreSummary {
                size: store.current_size,
                capacity: store.capacity,
                evictions: store.evictions,
            },
        }
    }
}

fn into_entry(key: Fingerprint, response: OriginResponse) -> CacheEntry {
    CacheEntry::new(key, response.status, response.headers, response.body)
}

/// True if any `Cache-Control` line carries `no-store` or `no-cache`.
pub fn client_forbids_caching(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim())
        .any(|directive| {
            directive.eq_ignore_ascii_case("no-store") || directive.eq_ignore_ascii_case("no-cache")
        })
}

/// Router that sends every method and path through the dispatcher.
pub fn router<O: Origin>(dispatcher: Arc<Dispatcher<O>>) -> Router {
    Router::new()
        .route("/{*path}", any(proxy_handler::<O>))
        .route("/", any(proxy_handler::<O>))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Main proxy handler.
pub async fn proxy_handler<O: Origin>(
    State(dispatcher): State<Arc<Dispatcher<O>>>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    match dispatcher.dispatch(req).await {
        Ok(served) => {
            let label = served.status.as_str();
            metrics::counter!("hoard_requests_total", "cache" => label).increment(1);
            metrics::histogram!("hoard_request_duration_seconds", "cache" => label)
                .record(start.elapsed().as_secs_f64());
            tracing::debug!(
                method = %method,
                uri = %uri,
                cache = label,
                status = served.entry.status.as_u16(),
                latency_us = start.elapsed().as_micros() as u64,
                "served"
            );
            write_response(&served.entry, served.status)
        }
        Err(e) => {
            metrics::counter!("hoard_upstream_errors_total").increment(1);
            tracing::error!(method = %method, uri = %uri, error = %e, "request failed");
            e.into_response()
        }
    }
}
