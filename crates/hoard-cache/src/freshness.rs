use crate::entry::CacheEntry;
use std::time::{Duration, Instant};

/// Default time-to-live for every entry of a proxy instance.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// True iff `now - entry.created_at <= ttl`. An entry aged exactly `ttl` is
/// still fresh.
#[inline]
pub fn is_fresh(entry: &CacheEntry, now: Instant, ttl: Duration) -> bool {
    entry.age(now) <= ttl
}
