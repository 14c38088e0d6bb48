use crate::arena::{Arena, Node};
use crate::entry::{CacheEntry, Fingerprint};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Snapshot of store statistics.
///
/// `hits` and `misses` count raw lookups. An entry found here but later
/// rejected by the caller (stale, wrong key) still counts as a hit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_size: usize,
    pub capacity: usize,
}

struct Inner {
    arena: Arena,
    index: HashMap<Fingerprint, u32, ahash::RandomState>,
}

/// Bounded, thread-safe LRU store of cached responses.
///
/// Lookups take the read lock only, so any number of them run in parallel.
/// A lookup stamps the node from a store-wide logical clock and, on the first
/// touch since the node was last repositioned, queues its index in `touched`.
/// Every write (`put`, `remove`, `clear`) holds the write lock and replays the
/// queued touches in stamp order before changing the list, so eviction always
/// sees exact access order.
///
/// `touched` holds at most one slot per live node.
pub struct LruStore {
    inner: RwLock<Inner>,
    touched: Mutex<Vec<u32>>,
    clock: AtomicU64,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LruStore {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be > 0");
        Self {
            inner: RwLock::new(Inner {
                arena: Arena::new(capacity),
                index: HashMap::with_capacity_and_hasher(capacity, ahash::RandomState::new()),
            }),
            touched: Mutex::new(Vec::with_capacity(capacity)),
            clock: AtomicU64::new(0),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up an entry and mark it most recently used. Freshness is not
    /// checked here.
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<CacheEntry>> {
        let inner = self.inner.read();
        let node = inner
            .index
            .get(key)
            .and_then(|&index| inner.arena.get(index).map(|node| (index, node)));

        match node {
            Some((index, node)) => {
                if node.touch(self.tick()) {
                    self.touched.lock().push(index);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&node.value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace `key`. A new key at capacity evicts the least
    /// recently used entry first.
    pub fn put(&self, key: Fingerprint, entry: Arc<CacheEntry>) {
        let mut inner = self.inner.write();
        self.replay_touches(&mut inner);

        if let Some(old) = inner.index.remove(&key) {
            inner.arena.remove(old);
        }

        while inner.arena.len() >= self.capacity {
            match inner.arena.pop_back() {
                Some(evicted) => {
                    inner.index.remove(&evicted.key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(key = %evicted.key, "evicted least recently used entry");
                }
                None => break,
            }
        }

        let node = Node::new(key.clone(), entry, self.tick());
        if let Some(index) = inner.arena.push_front(node) {
            inner.index.insert(key, index);
        }
    }

    /// Remove `key` if present.
    pub fn remove(&self, key: &Fingerprint) -> bool {
        let mut inner = self.inner.write();
        self.replay_touches(&mut inner);
        match inner.index.remove(key) {
            Some(index) => {
                inner.arena.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove `key` only while it still maps to `expected` (pointer identity).
    /// A concurrent `put` that replaced the entry wins.
    pub fn remove_if(&self, key: &Fingerprint, expected: &Arc<CacheEntry>) -> bool {
        let mut inner = self.inner.write();
        self.replay_touches(&mut inner);
        let index = match inner.index.get(key) {
            Some(&index) => index,
            None => return false,
        };
        let same = inner
            .arena
            .get(index)
            .is_some_and(|node| Arc::ptr_eq(&node.value, expected));
        if same {
            inner.index.remove(key);
            inner.arena.remove(index);
        }
        same
    }

    /// Drop every entry in one step. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.write();
        self.touched.lock().clear();
        let dropped = inner.arena.len();
        inner.arena.clear();
        inner.index.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.read().arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys from most to least recently used, with pending touches applied.
    pub fn keys_by_recency(&self) -> Vec<Fingerprint> {
        let mut inner = self.inner.write();
        self.replay_touches(&mut inner);
        inner.arena.keys()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity,
        }
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    // Caller holds the write lock, so no lookup can queue concurrently and
    // every queued index still refers to a live node.
    fn replay_touches(&self, inner: &mut Inner) {
        let mut pending = std::mem::take(&mut *self.touched.lock());
        if pending.is_empty() {
            return;
        }
        pending.sort_unstable_by_key(|&index| inner.arena.get(index).map_or(0, Node::last_access));
        for index in pending {
            if let Some(node) = inner.arena.get(index) {
                node.clear_touched();
                inner.arena.move_to_front(index);
            }
        }
    }
}
