//! Process-wide observability counters.
//!
//! Two counters are exported by name: `log_watcher_event_count`, keyed by
//! pathname and incremented for every routed OS event, and
//! `log_watcher_error_count`, incremented for every watcher-internal error.
//! They are side effects only and never influence control flow; tests may
//! snapshot and compare them by key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Routed watcher events, keyed by pathname.
pub static EVENT_COUNT: Lazy<CounterMap> =
    Lazy::new(|| CounterMap::new("log_watcher_event_count"));

/// Watcher-internal errors.
pub static ERROR_COUNT: Lazy<Counter> = Lazy::new(|| Counter::new("log_watcher_error_count"));

/// A named, monotonically increasing counter.
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    fn new(name: &'static str) -> Self {
        Counter {
            name,
            value: AtomicU64::new(0),
        }
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A named family of counters keyed by string.
pub struct CounterMap {
    name: &'static str,
    values: RwLock<HashMap<String, u64>>,
}

impl CounterMap {
    fn new(name: &'static str) -> Self {
        CounterMap {
            name,
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, key: &str, n: u64) {
        let mut values = self.values.write();
        *values.entry(key.to_string()).or_insert(0) += n;
    }

    pub fn get(&self, key: &str) -> u64 {
        self.values.read().get(key).copied().unwrap_or(0)
    }

    /// A point-in-time copy of every key and count.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.values.read().clone()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let counter = Counter::new("test_counter");
        assert_eq!(counter.get(), 0);
        counter.add(1);
        counter.add(2);
        assert_eq!(counter.get(), 3);
        assert_eq!(counter.name(), "test_counter");
    }

    #[test]
    fn counter_map_tracks_keys_independently() {
        let map = CounterMap::new("test_map");
        map.add("/a", 1);
        map.add("/b", 2);
        map.add("/a", 1);
        assert_eq!(map.get("/a"), 2);
        assert_eq!(map.get("/b"), 2);
        assert_eq!(map.get("/missing"), 0);

        let snapshot = map.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["/a"], 2);
    }

    #[test]
    fn exported_counters_have_stable_names() {
        assert_eq!(EVENT_COUNT.name(), "log_watcher_event_count");
        assert_eq!(ERROR_COUNT.name(), "log_watcher_error_count");
    }
}
