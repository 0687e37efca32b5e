//! Arena-backed recency list
//!
//! Nodes live in a slab and refer to their neighbours by slot handle; the
//! hash map owns `key -> handle`, the links only encode order. Every
//! operation is O(1) and no node ever holds a reference to another.
//!
//! ```text
//!   head (most recent)                             tail (least recent)
//!   [slot 3] <--> [slot 0] <--> [slot 5] <--> ... <--> [slot 1]
//!      ^             ^             ^                      ^
//!      +------ index: HashMap<K, Handle> ----------------+
//! ```

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::mem;
use std::time::Instant;

/// Slot index of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Handle(usize);

pub(crate) struct Node<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
    pub(crate) cost: u64,
    pub(crate) time: Instant,
    prev: Option<Handle>,
    next: Option<Handle>,
}

/// Contents removed wholesale by `take_all`
///
/// Dropping it drops every key and value, so it is handed to the release
/// policy rather than dropped under the store lock.
pub(crate) struct Drained<K, V> {
    slots: Vec<Option<Node<K, V>>>,
    index: HashMap<K, Handle>,
}

impl<K, V> Drained<K, V> {
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

pub(crate) struct LinkedMap<K, V> {
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, Handle>,
    head: Option<Handle>,
    tail: Option<Handle>,
    total_cost: u64,
}

impl<K: Hash + Eq + Clone, V> LinkedMap<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            total_cost: 0,
        }
    }

    pub(crate) const fn total_cost(&self) -> u64 {
        self.total_cost
    }

    pub(crate) fn total_count(&self) -> u64 {
        self.index.len() as u64
    }

    pub(crate) fn find<Q>(&self, key: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key).copied()
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&Node<K, V>> {
        self.slots.get(handle.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, handle: Handle) -> Option<&mut Node<K, V>> {
        self.slots.get_mut(handle.0).and_then(Option::as_mut)
    }

    /// Insert a new key as most recent
    pub(crate) fn insert_head(&mut self, key: K, value: V, cost: u64, time: Instant) -> Handle {
        let node = Node {
            key: key.clone(),
            value,
            cost,
            time,
            prev: None,
            next: None,
        };
        let handle = if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some(node);
            Handle(slot)
        } else {
            self.slots.push(Some(node));
            Handle(self.slots.len() - 1)
        };
        self.link_head(handle);
        self.index.insert(key, handle);
        self.total_cost = self.total_cost.saturating_add(cost);
        handle
    }

    /// Replace value and cost of an existing node and make it most recent
    ///
    /// Returns the previous value.
    pub(crate) fn update(&mut self, handle: Handle, value: V, cost: u64, time: Instant) -> Option<V> {
        let node = self.get_mut(handle)?;
        let old_cost = mem::replace(&mut node.cost, cost);
        let old_value = mem::replace(&mut node.value, value);
        node.time = time;
        self.total_cost = self.total_cost.saturating_sub(old_cost).saturating_add(cost);
        self.move_to_head(handle);
        Some(old_value)
    }

    /// Refresh access time and make the node most recent
    pub(crate) fn touch(&mut self, handle: Handle, time: Instant) -> Option<&V> {
        self.get_mut(handle)?.time = time;
        self.move_to_head(handle);
        self.get(handle).map(|node| &node.value)
    }

    pub(crate) fn move_to_head(&mut self, handle: Handle) {
        if self.head == Some(handle) {
            return;
        }
        self.unlink(handle);
        self.link_head(handle);
    }

    pub(crate) fn remove(&mut self, handle: Handle) -> Option<(K, V)> {
        self.get(handle)?;
        self.unlink(handle);
        let node = self.slots.get_mut(handle.0)?.take()?;
        self.free.push(handle.0);
        self.index.remove(&node.key);
        self.total_cost = self.total_cost.saturating_sub(node.cost);
        Some((node.key, node.value))
    }

    pub(crate) fn remove_tail(&mut self) -> Option<(K, V)> {
        let tail = self.tail?;
        self.remove(tail)
    }

    /// Last access time of the least recent node
    pub(crate) fn tail_time(&self) -> Option<Instant> {
        self.tail.and_then(|tail| self.get(tail)).map(|node| node.time)
    }

    /// Detach everything in O(1)
    pub(crate) fn take_all(&mut self) -> Drained<K, V> {
        let drained = Drained {
            slots: mem::take(&mut self.slots),
            index: mem::take(&mut self.index),
        };
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.total_cost = 0;
        drained
    }

    /// Keys from most to least recent
    pub(crate) fn keys(&self) -> impl Iterator<Item = &K> {
        std::iter::successors(self.head.and_then(|h| self.get(h)), |node| {
            node.next.and_then(|h| self.get(h))
        })
        .map(|node| &node.key)
    }

    fn unlink(&mut self, handle: Handle) {
        let Some(node) = self.get_mut(handle) else {
            return;
        };
        let (prev, next) = (node.prev.take(), node.next.take());
        match prev.and_then(|p| self.get_mut(p)) {
            Some(prev_node) => prev_node.next = next,
            None => self.head = next,
        }
        match next.and_then(|n| self.get_mut(n)) {
            Some(next_node) => next_node.prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_head(&mut self, handle: Handle) {
        let old_head = self.head;
        if let Some(node) = self.get_mut(handle) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(old) = old_head.and_then(|h| self.get_mut(h)) {
            old.prev = Some(handle);
        }
        self.head = Some(handle);
        if self.tail.is_none() {
            self.tail = Some(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk the list both ways and compare with the index and totals
    fn assert_consistent<K: Hash + Eq + Clone + std::fmt::Debug, V>(map: &LinkedMap<K, V>) {
        let forward: Vec<&K> = map.keys().collect();
        assert_eq!(forward.len(), map.index.len());

        let mut backward = Vec::new();
        let mut cursor = map.tail;
        while let Some(handle) = cursor {
            let node = map.get(handle).unwrap();
            backward.push(&node.key);
            cursor = node.prev;
        }
        backward.reverse();
        assert_eq!(forward, backward);

        let cost: u64 = map.index.values().map(|h| map.get(*h).unwrap().cost).sum();
        assert_eq!(cost, map.total_cost());
        for (key, handle) in &map.index {
            assert_eq!(&map.get(*handle).unwrap().key, key);
        }
    }

    fn keys(map: &LinkedMap<&'static str, u32>) -> Vec<&'static str> {
        map.keys().copied().collect()
    }

    #[test]
    fn test_insert_orders_most_recent_first() {
        let mut map = LinkedMap::new();
        let now = Instant::now();
        map.insert_head("a", 1, 10, now);
        map.insert_head("b", 2, 20, now);
        map.insert_head("c", 3, 30, now);

        assert_eq!(keys(&map), vec!["c", "b", "a"]);
        assert_eq!(map.total_cost(), 60);
        assert_eq!(map.total_count(), 3);
        assert_consistent(&map);
    }

    #[test]
    fn test_move_to_head() {
        let mut map = LinkedMap::new();
        let now = Instant::now();
        let a = map.insert_head("a", 1, 0, now);
        map.insert_head("b", 2, 0, now);
        let c = map.insert_head("c", 3, 0, now);

        // Tail to head
        map.move_to_head(a);
        assert_eq!(keys(&map), vec!["a", "c", "b"]);
        assert_consistent(&map);

        // Middle to head
        map.move_to_head(c);
        assert_eq!(keys(&map), vec!["c", "a", "b"]);
        assert_consistent(&map);

        // Head stays
        map.move_to_head(c);
        assert_eq!(keys(&map), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_update_adjusts_cost() {
        let mut map = LinkedMap::new();
        let now = Instant::now();
        let a = map.insert_head("a", 1, 10, now);
        map.insert_head("b", 2, 5, now);

        assert_eq!(map.update(a, 7, 0, now), Some(1));
        assert_eq!(map.total_cost(), 5);
        assert_eq!(keys(&map), vec!["a", "b"]);
        assert_eq!(map.get(a).unwrap().value, 7);
        assert_consistent(&map);
    }

    #[test]
    fn test_remove_and_slot_reuse() {
        let mut map = LinkedMap::new();
        let now = Instant::now();
        map.insert_head("a", 1, 1, now);
        let b = map.insert_head("b", 2, 2, now);
        map.insert_head("c", 3, 3, now);

        assert_eq!(map.remove(b), Some(("b", 2)));
        assert_eq!(map.remove(b), None);
        assert_eq!(keys(&map), vec!["c", "a"]);
        assert_eq!(map.total_cost(), 4);
        assert_consistent(&map);

        // Freed slot is reused
        let d = map.insert_head("d", 4, 4, now);
        assert_eq!(d, b);
        assert_eq!(map.slots.len(), 3);
        assert_consistent(&map);
    }

    #[test]
    fn test_remove_tail_until_empty() {
        let mut map = LinkedMap::new();
        let now = Instant::now();
        for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
            map.insert_head(key, i as u32, 1, now);
        }

        assert_eq!(map.remove_tail().map(|(k, _)| k), Some("a"));
        assert_eq!(map.remove_tail().map(|(k, _)| k), Some("b"));
        assert_eq!(map.remove_tail().map(|(k, _)| k), Some("c"));
        assert!(map.remove_tail().is_none());
        assert!(map.head.is_none());
        assert!(map.tail.is_none());
        assert_eq!(map.total_cost(), 0);
    }

    #[test]
    fn test_take_all() {
        let mut map = LinkedMap::new();
        let now = Instant::now();
        map.insert_head("a", 1, 1, now);
        map.insert_head("b", 2, 2, now);

        let drained = map.take_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(map.total_count(), 0);
        assert_eq!(map.total_cost(), 0);
        assert!(map.find("a").is_none());
        assert!(map.tail_time().is_none());

        map.insert_head("c", 3, 3, now);
        assert_eq!(keys(&map), vec!["c"]);
        assert_consistent(&map);
    }

    #[test]
    fn test_touch_refreshes_time() {
        let mut map = LinkedMap::new();
        let start = Instant::now();
        let a = map.insert_head("a", 1, 0, start);
        map.insert_head("b", 2, 0, start);
        assert_eq!(map.tail_time(), Some(start));

        let later = start + std::time::Duration::from_secs(1);
        assert_eq!(map.touch(a, later), Some(&1));
        assert_eq!(keys(&map), vec!["a", "b"]);
        assert_eq!(map.get(a).unwrap().time, later);
        assert_eq!(map.tail_time(), Some(start));
    }
}
