//! Debouncing
//!
//! Collapses bursts of events per key: the last value observed for a key is
//! released once no new event for that key arrived within the window.
//! Time is passed in explicitly so the logic stays deterministic.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Pending<V> {
    value: V,
    first_seen: Instant,
    last_seen: Instant,
    seq: u64,
}

/// Per-key debouncer.
#[derive(Debug)]
pub struct Debouncer<K, V> {
    window: Duration,
    pending: HashMap<K, Pending<V>>,
    seq: u64,
}

impl<K: Eq + Hash + Clone, V> Debouncer<K, V> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            seq: 0,
        }
    }

    /// Records an event; returns true when the key was not pending.
    pub fn observe(&mut self, key: K, value: V, now: Instant) -> bool {
        match self.pending.get_mut(&key) {
            Some(entry) => {
                entry.value = value;
                entry.last_seen = now;
                false
            }
            None => {
                self.seq += 1;
                self.pending.insert(
                    key,
                    Pending {
                        value,
                        first_seen: now,
                        last_seen: now,
                        seq: self.seq,
                    },
                );
                true
            }
        }
    }

    /// Removes and returns the values whose key has been quiet for at least
    /// the window, oldest burst first.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<V> {
        let ready: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) >= self.window)
            .map(|(key, _)| key.clone())
            .collect();

        self.take_sorted(ready)
    }

    /// Removes and returns everything pending, oldest burst first.
    pub fn drain_all(&mut self) -> Vec<V> {
        let keys: Vec<K> = self.pending.keys().cloned().collect();
        self.take_sorted(keys)
    }

    fn take_sorted(&mut self, keys: Vec<K>) -> Vec<V> {
        let mut entries: Vec<Pending<V>> = keys
            .into_iter()
            .filter_map(|key| self.pending.remove(&key))
            .collect();
        entries.sort_by_key(|entry| (entry.first_seen, entry.seq));
        entries.into_iter().map(|entry| entry.value).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
