//! Keyed deadline queue used by every engine for its protocol timers
//!
//! Engines never sleep. They arm deadlines here and the owner of the core
//! context calls `process_timeouts(now)` on each engine periodically.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// At most one deadline per key; re-arming replaces the previous one
#[derive(Debug)]
pub struct TimerQueue<K> {
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
        }
    }

    /// Arm (or re-arm) the timer for `key` to fire `timeout` from now
    pub fn arm(&mut self, key: K, timeout: Duration) {
        self.arm_at(key, Instant::now() + timeout);
    }

    pub fn arm_at(&mut self, key: K, deadline: Instant) {
        self.deadlines.insert(key, deadline);
    }

    /// Cancel the timer for `key`; returns whether one was armed
    pub fn cancel(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Cancel every timer whose key matches the predicate
    pub fn cancel_where<F: Fn(&K) -> bool>(&mut self, pred: F) {
        self.deadlines.retain(|k, _| !pred(k));
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.deadlines.get(key).copied()
    }

    /// Earliest armed deadline, for callers driving a sleep loop
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Remove and return every key due at `now`, earliest first
    pub fn expired(&mut self, now: Instant) -> Vec<K> {
        let mut due: Vec<(K, Instant)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(k, d)| (k.clone(), *d))
            .collect();
        due.sort_by_key(|(_, d)| *d);

        for (key, _) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(k, _)| k).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let base = Instant::now();
        timers.arm_at("b", base + Duration::from_secs(2));
        timers.arm_at("a", base + Duration::from_secs(1));
        timers.arm_at("c", base + Duration::from_secs(10));

        assert!(timers.expired(base).is_empty());
        assert_eq!(timers.expired(base + Duration::from_secs(5)), vec!["a", "b"]);
        assert!(timers.is_armed(&"c"));
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_rearm_replaces() {
        let mut timers = TimerQueue::new();
        let base = Instant::now();
        timers.arm_at(1u8, base + Duration::from_secs(1));
        timers.arm_at(1u8, base + Duration::from_secs(30));
        assert!(timers.expired(base + Duration::from_secs(2)).is_empty());
        assert!(timers.cancel(&1));
        assert!(!timers.cancel(&1));
    }
}
