//! Time-ordered index: a binary min-heap with a key → slot table.
//!
//! The heap is ordered by `(priority, insertion sequence)`, so equal
//! priorities pop in insertion order. A hash table maps each live key to its
//! current heap slot and is updated on every swap, giving O(1) `contains`,
//! `get` and `remove`.
//!
//! Removal by key is lazy: the slot is emptied in place and the key leaves
//! the table, but the slot keeps its priority so the heap property still
//! holds. Empty slots are discarded when they reach the root, and the whole
//! heap is compacted once they make up more than half of it.
//!
//! Invariants:
//! - heap property over `(priority, seq)` for every slot, live or not;
//! - `positions[k] == i` iff `slots[i]` is live with key `k`;
//! - `deleted` equals the number of empty slots.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

const MIN_COMPACT_LEN: usize = 32;
const MIN_SHRINK_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("key is already present in the index")]
    DuplicateKey,

    #[error("index was modified during enumeration")]
    ConcurrentModification,
}

#[derive(Debug, Clone)]
struct Slot<K, P, V> {
    key: K,
    priority: P,
    seq: u64,
    value: Option<V>,
}

impl<K, P: Ord, V> Slot<K, P, V> {
    fn precedes(&self, other: &Self) -> bool {
        (&self.priority, self.seq) < (&other.priority, other.seq)
    }
}

/// Single-threaded indexed min-heap with lazy deletion.
#[derive(Debug, Clone)]
pub struct IndexedHeap<K, P, V> {
    slots: Vec<Slot<K, P, V>>,
    positions: HashMap<K, usize>,
    deleted: usize,
    next_seq: u64,
    version: u64,
}

impl<K, P, V> Default for IndexedHeap<K, P, V>
where
    K: Hash + Eq + Clone,
    P: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P, V> IndexedHeap<K, P, V>
where
    K: Hash + Eq + Clone,
    P: Ord,
{
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
            deleted: 0,
            next_seq: 0,
            version: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Number of lazily deleted slots still held by the heap.
    pub fn deleted_len(&self) -> usize {
        self.deleted
    }

    /// Incremented on every structural change.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let slot = *self.positions.get(key)?;
        self.slots[slot].value.as_ref()
    }

    /// Insert a new entry. Keys must be unique among live entries.
    pub fn push(&mut self, key: K, priority: P, value: V) -> Result<(), IndexError> {
        if self.positions.contains_key(&key) {
            return Err(IndexError::DuplicateKey);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let index = self.slots.len();
        self.positions.insert(key.clone(), index);
        self.slots.push(Slot {
            key,
            priority,
            seq,
            value: Some(value),
        });
        self.sift_up(index);
        self.version += 1;
        Ok(())
    }

    /// Lazily remove the entry for `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.positions.remove(key)?;
        let value = self.slots[index].value.take();
        self.deleted += 1;
        self.version += 1;
        self.maybe_compact();
        value
    }

    /// Earliest live entry. Takes `&mut self` to discard deleted roots.
    pub fn peek(&mut self) -> Option<(&P, &V)> {
        self.prune_root();
        let root = self.slots.first()?;
        root.value.as_ref().map(|v| (&root.priority, v))
    }

    /// Remove and return the earliest live entry.
    pub fn pop(&mut self) -> Option<(K, P, V)> {
        self.prune_root();
        let slot = self.take_root()?;
        let value = slot.value?;
        self.positions.remove(&slot.key);
        self.version += 1;
        self.maybe_shrink();
        Some((slot.key, slot.priority, value))
    }

    /// Pop the earliest live entry only if `ready` accepts its priority.
    pub fn pop_if<F>(&mut self, ready: F) -> Option<(K, P, V)>
    where
        F: FnOnce(&P) -> bool,
    {
        let accept = match self.peek() {
            Some((priority, _)) => ready(priority),
            None => false,
        };
        if accept {
            self.pop()
        } else {
            None
        }
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.positions.clear();
        self.deleted = 0;
        self.version += 1;
        self.maybe_shrink();
    }

    /// Live entries in heap-slot order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = (&K, &P, &V)> + '_ {
        self.slots
            .iter()
            .filter_map(|s| s.value.as_ref().map(|v| (&s.key, &s.priority, v)))
    }

    /// Live entry at a raw slot, skipping nothing. Used by cursors.
    fn slot_at(&self, index: usize) -> Option<Option<(&K, &P, &V)>> {
        self.slots
            .get(index)
            .map(|s| s.value.as_ref().map(|v| (&s.key, &s.priority, v)))
    }

    /// Discard every lazily deleted slot and rebuild the heap.
    pub fn compact(&mut self) {
        if self.deleted == 0 {
            return;
        }
        self.slots.retain(|s| s.value.is_some());
        self.deleted = 0;
        self.positions.clear();
        for (i, slot) in self.slots.iter().enumerate() {
            self.positions.insert(slot.key.clone(), i);
        }
        for i in (0..self.slots.len() / 2).rev() {
            self.sift_down(i);
        }
        self.version += 1;
        self.maybe_shrink();
    }

    fn maybe_compact(&mut self) {
        if self.slots.len() >= MIN_COMPACT_LEN && self.deleted * 2 > self.slots.len() {
            self.compact();
        }
    }

    fn maybe_shrink(&mut self) {
        let live = self.slots.len();
        if self.slots.capacity() > MIN_SHRINK_CAPACITY && self.slots.capacity() > live * 4 {
            self.slots.shrink_to(live * 2);
            self.positions.shrink_to(self.positions.len() * 2);
        }
    }

    fn prune_root(&mut self) {
        while self.slots.first().is_some_and(|s| s.value.is_none()) {
            if self.take_root().is_none() {
                break;
            }
            self.deleted -= 1;
            self.version += 1;
        }
    }

    fn take_root(&mut self) -> Option<Slot<K, P, V>> {
        let last = self.slots.len().checked_sub(1)?;
        self.swap(0, last);
        let root = self.slots.pop()?;
        if !self.slots.is_empty() {
            self.sift_down(0);
        }
        Some(root)
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if !self.slots[index].precedes(&self.slots[parent]) {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.slots.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < len && self.slots[left].precedes(&self.slots[smallest]) {
                smallest = left;
            }
            if right < len && self.slots[right].precedes(&self.slots[smallest]) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.slots.swap(a, b);
        for i in [a, b] {
            let slot = &self.slots[i];
            if slot.value.is_some() {
                if let Some(position) = self.positions.get_mut(&slot.key) {
                    *position = i;
                }
            }
        }
    }
}

/// Thread-safe wrapper serialising every operation under one lock.
///
/// The lock only ever covers in-memory work; callers must not hold results
/// that borrow from it, so every accessor clones what it returns.
#[derive(Debug)]
pub struct SharedIndex<K, P, V> {
    inner: Arc<Mutex<IndexedHeap<K, P, V>>>,
}

impl<K, P, V> Clone for SharedIndex<K, P, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, P, V> Default for SharedIndex<K, P, V>
where
    K: Hash + Eq + Clone,
    P: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, P, V> SharedIndex<K, P, V>
where
    K: Hash + Eq + Clone,
    P: Ord,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(IndexedHeap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn push(&self, key: K, priority: P, value: V) -> Result<(), IndexError> {
        self.inner.lock().push(key, priority, value)
    }

    /// Insert many entries under a single lock acquisition.
    ///
    /// Returns the number inserted; duplicates are skipped.
    pub fn push_all<I>(&self, items: I) -> usize
    where
        I: IntoIterator<Item = (K, P, V)>,
    {
        let mut guard = self.inner.lock();
        let mut inserted = 0;
        for (key, priority, value) in items {
            if guard.push(key, priority, value).is_ok() {
                inserted += 1;
            }
        }
        inserted
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    /// Remove `key` only if `accept` approves its current value.
    pub fn remove_if<F>(&self, key: &K, accept: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut guard = self.inner.lock();
        let approved = guard.get(key).is_some_and(accept);
        if approved {
            guard.remove(key)
        } else {
            None
        }
    }

    pub fn pop(&self) -> Option<(K, P, V)> {
        self.inner.lock().pop()
    }

    pub fn pop_if<F>(&self, ready: F) -> Option<(K, P, V)>
    where
        F: FnOnce(&P) -> bool,
    {
        self.inner.lock().pop_if(ready)
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Start a version-checked enumeration.
    pub fn cursor(&self) -> Cursor<K, P, V> {
        Cursor {
            index: self.clone(),
            version: self.version(),
            position: 0,
        }
    }
}

impl<K, P, V> SharedIndex<K, P, V>
where
    K: Hash + Eq + Clone,
    P: Ord + Clone,
    V: Clone,
{
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Priority of the earliest live entry.
    pub fn peek_priority(&self) -> Option<P> {
        self.inner.lock().peek().map(|(p, _)| p.clone())
    }

    /// Clone of every live entry, in slot order.
    pub fn snapshot(&self) -> Vec<(K, P, V)> {
        self.inner
            .lock()
            .iter()
            .map(|(k, p, v)| (k.clone(), p.clone(), v.clone()))
            .collect()
    }
}

/// Enumeration over a [`SharedIndex`] that fails if the index changes.
///
/// Each step takes the lock briefly; any structural mutation between steps
/// makes the next call return [`IndexError::ConcurrentModification`].
pub struct Cursor<K, P, V> {
    index: SharedIndex<K, P, V>,
    version: u64,
    position: usize,
}

impl<K, P, V> Cursor<K, P, V>
where
    K: Hash + Eq + Clone,
    P: Ord + Clone,
    V: Clone,
{
    pub fn next_entry(&mut self) -> Result<Option<(K, P, V)>, IndexError> {
        let guard = self.index.inner.lock();
        if guard.version() != self.version {
            return Err(IndexError::ConcurrentModification);
        }
        loop {
            let position = self.position;
            match guard.slot_at(position) {
                None => return Ok(None),
                Some(entry) => {
                    self.position += 1;
                    if let Some((k, p, v)) = entry {
                        return Ok(Some((k.clone(), p.clone(), v.clone())));
                    }
                }
            }
        }
    }
}

impl<K, P, V> Iterator for Cursor<K, P, V>
where
    K: Hash + Eq + Clone,
    P: Ord + Clone,
    V: Clone,
{
    type Item = Result<(K, P, V), IndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
