//! The priority queue contract and its default binary-heap backing.
//!
//! Keyed by `(deadline, id)` so that extraction order is exactly the
//! lexicographic minimum: earliest deadline first, lowest id breaking ties.
//! The default implementation below is a tombstone/lazy-discard heap — cancel
//! removes an item from the id-indexed slot map in O(1) amortized and leaves
//! the heap entry to be skipped (and dropped) the next time it would
//! otherwise surface, per the contract's own stated allowance that "the
//! queue may contain records whose work has been canceled, which are
//! dropped on extraction."

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// A multiset of `(key, payload)` pairs ordered by `key`, parametric in the
/// payload type. Alternative backings (pairing heap, skiplist) may implement
/// this instead of [`BinaryHeapQueue`]; the scheduler depends only on this
/// trait.
pub trait PriorityQueue<K: Ord + Copy, P> {
    fn add(&mut self, key: K, payload: P) -> u64;
    fn peek_min(&mut self) -> Option<(K, &P)>;
    fn remove_min(&mut self) -> Option<(K, P)>;
    fn remove<F: FnMut(&P) -> bool>(&mut self, predicate: F) -> Option<(K, P)>;
    fn remove_token(&mut self, token: u64) -> Option<(K, P)>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default [`PriorityQueue`] implementation: a binary min-heap of `(key,
/// token)` pairs plus a token→`(key, payload)` slot map. `add` hands back an
/// opaque `token`; `remove_token` is the O(1)-amortized cancel path the
/// scheduler actually uses (the generic `remove(predicate)` is a linear scan
/// over the slot map, useful for the general contract but not the hot path).
pub struct BinaryHeapQueue<K: Ord + Copy, P> {
    heap: BinaryHeap<Reverse<(K, u64)>>,
    slots: HashMap<u64, (K, P)>,
    next_token: u64,
}

impl<K: Ord + Copy, P> Default for BinaryHeapQueue<K, P> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
            next_token: 0,
        }
    }
}

impl<K: Ord + Copy, P> BinaryHeapQueue<K, P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop heap entries whose token no longer has a live slot (tombstones),
    /// until the real minimum (or emptiness) is exposed.
    fn discard_stale(&mut self) {
        while let Some(&Reverse((_, token))) = self.heap.peek() {
            if self.slots.contains_key(&token) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<K: Ord + Copy, P> PriorityQueue<K, P> for BinaryHeapQueue<K, P> {
    fn add(&mut self, key: K, payload: P) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.slots.insert(token, (key, payload));
        self.heap.push(Reverse((key, token)));
        token
    }

    fn peek_min(&mut self) -> Option<(K, &P)> {
        self.discard_stale();
        let Reverse((key, token)) = self.heap.peek()?;
        let (_, payload) = self.slots.get(token)?;
        Some((*key, payload))
    }

    fn remove_min(&mut self) -> Option<(K, P)> {
        self.discard_stale();
        let Reverse((_, token)) = self.heap.pop()?;
        self.slots.remove(&token)
    }

    fn remove<F: FnMut(&P) -> bool>(&mut self, mut predicate: F) -> Option<(K, P)> {
        let hit = self
            .slots
            .iter()
            .find(|(_, (_, payload))| predicate(payload))
            .map(|(token, _)| *token)?;
        self.slots.remove(&hit)
        // The heap entry for `hit` is left in place as a tombstone; it is
        // skipped by `discard_stale` the next time the heap is queried.
    }

    fn remove_token(&mut self, token: u64) -> Option<(K, P)> {
        self.slots.remove(&token)
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_and_pop_in_key_order() {
        let mut q: BinaryHeapQueue<(u32, u64), &'static str> = BinaryHeapQueue::new();
        q.add((3, 0), "c");
        q.add((1, 1), "a");
        q.add((2, 2), "b");

        assert_eq!(q.peek_min().map(|(k, p)| (k, *p)), Some(((1, 1), "a")));
        assert_eq!(q.remove_min(), Some(((1, 1), "a")));
        assert_eq!(q.remove_min(), Some(((2, 2), "b")));
        assert_eq!(q.remove_min(), Some(((3, 0), "c")));
        assert_eq!(q.remove_min(), None);
    }

    #[test]
    fn equal_keys_break_tie_by_second_component() {
        let mut q: BinaryHeapQueue<(u32, u64), u64> = BinaryHeapQueue::new();
        q.add((1, 5), 5);
        q.add((1, 2), 2);
        assert_eq!(q.remove_min(), Some(((1, 2), 2)));
        assert_eq!(q.remove_min(), Some(((1, 5), 5)));
    }

    #[test]
    fn cancel_head_exposes_new_minimum() {
        let mut q: BinaryHeapQueue<(u32, u64), &'static str> = BinaryHeapQueue::new();
        let tok_a = q.add((1, 0), "a");
        q.add((2, 1), "b");
        assert_eq!(q.remove_token(tok_a), Some(((1, 0), "a")));
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek_min().map(|(k, p)| (k, *p)), Some(((2, 1), "b")));
    }

    #[test]
    fn remove_by_predicate_tombstones_heap_entry() {
        let mut q: BinaryHeapQueue<(u32, u64), &'static str> = BinaryHeapQueue::new();
        q.add((1, 0), "a");
        q.add((2, 1), "b");
        let removed = q.remove(|p| *p == "a");
        assert_eq!(removed, Some(((1, 0), "a")));
        assert_eq!(q.len(), 1);
        assert_eq!(q.remove_min(), Some(((2, 1), "b")));
        assert!(q.is_empty());
    }
}
