use crate::entry::{CacheEntry, Fingerprint};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Sentinel value indicating "no node".
pub const NIL: u32 = u32::MAX;

/// A slot in the recency list.
///
/// `last_access` and `touched` are atomics so a lookup holding only a shared
/// lock can record that the node was used.
pub struct Node {
    pub key: Fingerprint,
    pub value: Arc<CacheEntry>,
    last_access: AtomicU64,
    touched: AtomicBool,
    pub prev: u32,
    pub next: u32,
}

impl Node {
    pub fn new(key: Fingerprint, value: Arc<CacheEntry>, stamp: u64) -> Self {
        Self {
            key,
            value,
            last_access: AtomicU64::new(stamp),
            touched: AtomicBool::new(false),
            prev: NIL,
            next: NIL,
        }
    }

    /// Record an access at `stamp`. Returns true if this is the first touch
    /// since the node was last repositioned, i.e. the caller must queue it.
    #[inline]
    pub fn touch(&self, stamp: u64) -> bool {
        self.last_access.fetch_max(stamp, Ordering::Relaxed);
        !self.touched.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn clear_touched(&self) {
        self.touched.store(false, Ordering::Release);
    }

    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

/// Arena-allocated doubly-linked list ordered from most to least recently used.
///
/// Nodes live in a pre-sized `Vec<Option<Node>>`; `u32` indices are the links.
/// Freed slots go back on a free list, so the arena never grows past the
/// capacity it was built with.
pub struct Arena {
    slots: Vec<Option<Node>>,
    free_list: Vec<u32>,
    pub head: u32,
    pub tail: u32,
    len: usize,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            free_list: (0..capacity as u32).rev().collect(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&Node> {
        self.slots.get(index as usize).and_then(|s| s.as_ref())
    }

    fn node_mut(&mut self, index: u32) -> Option<&mut Node> {
        self.slots.get_mut(index as usize).and_then(|s| s.as_mut())
    }

    /// Place a node at the front (most recently used). Returns its index, or
    /// `None` if every slot is taken.
    pub fn push_front(&mut self, mut node: Node) -> Option<u32> {
        let index = self.free_list.pop()?;
        node.prev = NIL;
        node.next = self.head;
        self.slots[index as usize] = Some(node);
        self.link_front(index);
        self.len += 1;
        Some(index)
    }

    /// Take a node out of the list and release its slot.
    pub fn remove(&mut self, index: u32) -> Option<Node> {
        let node = self.slots.get_mut(index as usize)?.take()?;
        self.unlink(node.prev, node.next);
        self.free_list.push(index);
        self.len -= 1;
        Some(node)
    }

    /// Reposition an existing node at the front.
    pub fn move_to_front(&mut self, index: u32) {
        if self.head == index {
            return;
        }
        let (prev, next) = match self.get(index) {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        self.unlink(prev, next);
        let head = self.head;
        if let Some(node) = self.node_mut(index) {
            node.prev = NIL;
            node.next = head;
        }
        self.link_front(index);
    }

    /// Remove and return the least recently used node.
    pub fn pop_back(&mut self) -> Option<Node> {
        if self.tail == NIL {
            return None;
        }
        self.remove(self.tail)
    }

    /// Drop every node and reclaim all slots.
    pub fn clear(&mut self) {
        let capacity = self.slots.len();
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.free_list = (0..capacity as u32).rev().collect();
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<Fingerprint> {
        let mut keys = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(node) = self.get(cursor) {
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    // Expects `index` to already carry prev = NIL and next = old head.
    fn link_front(&mut self, index: u32) {
        let old_head = self.head;
        if let Some(head) = self.node_mut(old_head) {
            head.prev = index;
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }
    }

    fn unlink(&mut self, prev: u32, next: u32) {
        match self.node_mut(prev) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match self.node_mut(next) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    fn node(key: &str) -> Node {
        let entry = CacheEntry::new(
            Fingerprint::from(key),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"test"),
        );
        Node::new(Fingerprint::from(key), Arc::new(entry), 0)
    }

    fn keys(arena: &Arena) -> Vec<String> {
        arena.keys().iter().map(|k| k.as_str().to_string()).collect()
    }

    #[test]
    fn empty_arena() {
        let arena = Arena::new(4);
        assert!(arena.is_empty());
        assert_eq!(arena.head, NIL);
        assert_eq!(arena.tail, NIL);
    }

    #[test]
    fn push_front_orders_newest_first() {
        let mut arena = Arena::new(4);
        let a = arena.push_front(node("a")).unwrap();
        arena.push_front(node("b"));
        arena.push_front(node("c"));
        assert_eq!(keys(&arena), ["c", "b", "a"]);
        assert_eq!(arena.tail, a);
    }

    #[test]
    fn remove_middle_relinks_neighbours() {
        let mut arena = Arena::new(4);
        let a = arena.push_front(node("a")).unwrap();
        let b = arena.push_front(node("b")).unwrap();
        let c = arena.push_front(node("c")).unwrap();

        assert_eq!(arena.remove(b).unwrap().key.as_str(), "b");
        assert_eq!(arena.get(c).unwrap().next, a);
        assert_eq!(arena.get(a).unwrap().prev, c);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn remove_only_node_empties_list() {
        let mut arena = Arena::new(2);
        let a = arena.push_front(node("a")).unwrap();
        arena.remove(a);
        assert_eq!(arena.head, NIL);
        assert_eq!(arena.tail, NIL);
        assert!(arena.remove(a).is_none());
    }

    #[test]
    fn move_tail_to_front() {
        let mut arena = Arena::new(4);
        let a = arena.push_front(node("a")).unwrap();
        arena.push_front(node("b"));
        arena.push_front(node("c"));

        arena.move_to_front(a);
        assert_eq!(keys(&arena), ["a", "c", "b"]);
        assert_eq!(arena.get(arena.tail).unwrap().key.as_str(), "b");
    }

    #[test]
    fn move_middle_to_front_links_both_directions() {
        let mut arena = Arena::new(4);
        let a = arena.push_front(node("a")).unwrap();
        let b = arena.push_front(node("b")).unwrap();
        let c = arena.push_front(node("c")).unwrap();

        arena.move_to_front(b);
        assert_eq!(keys(&arena), ["b", "c", "a"]);
        assert_eq!(arena.head, b);
        assert_eq!(arena.get(b).unwrap().prev, NIL);
        assert_eq!(arena.get(b).unwrap().next, c);
        assert_eq!(arena.get(c).unwrap().prev, b);
        assert_eq!(arena.get(c).unwrap().next, a);
        assert_eq!(arena.tail, a);

        arena.move_to_front(b);
        assert_eq!(keys(&arena), ["b", "c", "a"]);
    }

    #[test]
    fn pop_back_returns_least_recent() {
        let mut arena = Arena::new(4);
        arena.push_front(node("a"));
        arena.push_front(node("b"));
        assert_eq!(arena.pop_back().unwrap().key.as_str(), "a");
        assert_eq!(keys(&arena), ["b"]);
    }

    #[test]
    fn full_arena_refuses_then_reuses_slot() {
        let mut arena = Arena::new(2);
        let a = arena.push_front(node("a")).unwrap();
        arena.push_front(node("b"));
        assert!(arena.push_front(node("c")).is_none());

        arena.remove(a);
        assert!(arena.push_front(node("c")).is_some());
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn clear_reclaims_every_slot() {
        let mut arena = Arena::new(2);
        arena.push_front(node("a"));
        arena.push_front(node("b"));
        arena.clear();
        assert!(arena.is_empty());
        assert!(arena.push_front(node("c")).is_some());
        assert!(arena.push_front(node("d")).is_some());
    }

    #[test]
    fn touch_reports_first_access_only() {
        let n = node("a");
        assert!(n.touch(5));
        assert!(!n.touch(3));
        assert_eq!(n.last_access(), 5);
        n.clear_touched();
        assert!(n.touch(7));
    }
}
