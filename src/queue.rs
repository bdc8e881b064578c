//! Task Queue with lazy deletion
//!
//! Uses std::collections::BinaryHeap with a HashMap index from task to its
//! live entry. remove() tombstones the entry in place instead of restructuring
//! the heap; tombstones are discarded when pop() reaches them.
//!
//! Not thread-safe by itself: the system clock only touches it under its lock.

use crate::error::QueueError;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

/// Key for the heap.
/// Uses (time, seq) so every entry has a unique, FIFO-at-equal-time ordering.
#[derive(Clone, Debug)]
struct Key {
    time: f64,
    seq: u64,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.time.to_bits() == other.time.to_bits() && self.seq == other.seq
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap, so we reverse the ordering for min-heap behavior.
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.time.total_cmp(&other.time) {
            Ordering::Equal => self.seq.cmp(&other.seq),
            o => o,
        }
        .reverse()
    }
}

/// A min-priority queue of `(time, task)` pairs.
///
/// A task has at most one live entry: adding it again moves it.
pub struct TaskQueue<T> {
    heap: BinaryHeap<Key>,
    /// seq -> task. `None` is a tombstone.
    slots: HashMap<u64, Option<T>>,
    /// task -> (time, seq) of its live entry.
    index: HashMap<T, (f64, u64)>,
    tombstones: usize,
    seq: u64,
}

impl<T: Eq + Hash + Clone> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Eq + Hash + Clone> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
            index: HashMap::new(),
            tombstones: 0,
            seq: 0,
        }
    }

    /// Add a task at `time`, or move it there if it is already queued.
    /// The entry always gets a fresh sequence number.
    pub fn add(&mut self, time: f64, task: T) {
        if let Some((_, stale)) = self.index.remove(&task) {
            if let Some(slot) = self.slots.get_mut(&stale) {
                *slot = None;
                self.tombstones += 1;
            }
        }
        let seq = self.seq;
        self.seq += 1;
        self.slots.insert(seq, Some(task.clone()));
        self.index.insert(task, (time, seq));
        self.heap.push(Key { time, seq });
    }

    /// Tombstone the live entry of `task`.
    pub fn remove(&mut self, task: &T) -> Result<(), QueueError> {
        let (_, seq) = self.index.remove(task).ok_or(QueueError::TaskNotFound)?;
        if let Some(slot) = self.slots.get_mut(&seq) {
            *slot = None;
            self.tombstones += 1;
        }
        Ok(())
    }

    /// Remove and return the earliest live entry.
    pub fn pop(&mut self) -> Result<(f64, T), QueueError> {
        while let Some(key) = self.heap.pop() {
            match self.slots.remove(&key.seq) {
                Some(Some(task)) => {
                    self.index.remove(&task);
                    return Ok((key.time, task));
                }
                Some(None) => self.tombstones -= 1,
                None => {}
            }
        }
        Err(QueueError::EmptyQueue)
    }

    /// The earliest live entry, without removing it.
    ///
    /// Leading tombstones are scanned past, not reclaimed; only pop() does that.
    pub fn peek(&self) -> Result<(f64, &T), QueueError> {
        let top = self.heap.peek().ok_or(QueueError::EmptyQueue)?;
        if let Some(Some(task)) = self.slots.get(&top.seq) {
            return Ok((top.time, task));
        }
        // Keys order in reverse, so the greatest key is the earliest entry.
        self.heap
            .iter()
            .filter_map(|k| match self.slots.get(&k.seq) {
                Some(Some(task)) => Some((k, task)),
                _ => None,
            })
            .max_by(|a, b| a.0.cmp(b.0))
            .map(|(k, task)| (k.time, task))
            .ok_or(QueueError::EmptyQueue)
    }

    /// Time of the live entry for `task`, if any.
    pub fn time_of(&self, task: &T) -> Option<f64> {
        self.index.get(task).map(|(time, _)| *time)
    }

    pub fn contains(&self, task: &T) -> bool {
        self.index.contains_key(task)
    }

    /// Check if the queue has no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.heap.len() - self.tombstones
    }

    /// Reset to the empty state, including the sequence counter.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
