//! Cache core for the hoard HTTP caching proxy.
//!
//! - [`lru::LruStore`]: bounded LRU store keyed by [`entry::Fingerprint`]
//! - [`freshness::is_fresh`]: fixed-TTL freshness check
//! - [`coalesce::Coalescer`]: at most one in-flight fetch per key

pub mod arena;
pub mod coalesce;
pub mod entry;
pub mod freshness;
pub mod lru;

pub use coalesce::{Coalescer, CoalescerStats, FetchAborted};
pub use entry::{CacheEntry, Fingerprint};
pub use freshness::{is_fresh, DEFAULT_TTL};
pub use lru::{LruStore, StoreStats};
