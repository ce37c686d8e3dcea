//! Bounded most-recently-seen set.
//!
//! Used to recognise message stamps that were already processed so floods
//! terminate, and to remember addresses recently heard from. Eviction is
//! true LRU: re-inserting a key refreshes it.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug)]
struct Inner<K> {
    by_key: HashMap<K, u64>,
    by_age: BTreeMap<u64, K>,
    tick: u64,
}

/// A thread-safe LRU set with a fixed capacity.
#[derive(Debug)]
pub struct DedupWindow<K> {
    inner: Mutex<Inner<K>>,
    capacity: usize,
}

impl<K> DedupWindow<K>
where
    K: Hash + Eq + Clone,
{
    /// Create a window holding at most `capacity` keys (minimum one).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_key: HashMap::with_capacity(capacity.min(4096)),
                by_age: BTreeMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Insert or refresh `key`, evicting the least recently touched key
    /// when over capacity.
    pub fn insert(&self, key: K) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(old) = inner.by_key.insert(key.clone(), tick) {
            inner.by_age.remove(&old);
        }
        inner.by_age.insert(tick, key);
        while inner.by_key.len() > self.capacity {
            let Some((_, evicted)) = inner.by_age.pop_first() else {
                break;
            };
            inner.by_key.remove(&evicted);
        }
    }

    /// True if `key` is in the window. Does not refresh it.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().by_key.contains_key(key)
    }

    /// Insert `key`, returning true if it was already present.
    pub fn check_and_insert(&self, key: K) -> bool {
        let seen = self.contains(&key);
        self.insert(key);
        seen
    }

    /// Keys from least to most recently touched.
    pub fn snapshot(&self) -> Vec<K> {
        self.inner.lock().by_age.values().cloned().collect()
    }

    /// Drop every key.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_key.clear();
        inner.by_age.clear();
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.inner.lock().by_key.len()
    }

    /// True if no keys are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of keys held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_contains_after_insert() {
        let window = DedupWindow::new(3);
        window.insert(1u64);
        assert!(window.contains(&1));
        assert!(!window.contains(&2));
    }

    #[test]
    fn test_evicts_least_recently_touched() {
        let window = DedupWindow::new(3);
        window.insert(1u64);
        window.insert(2);
        window.insert(3);
        // Refresh 1 so 2 becomes the oldest.
        window.insert(1);
        window.insert(4);

        assert!(window.contains(&1));
        assert!(!window.contains(&2));
        assert!(window.contains(&3));
        assert!(window.contains(&4));
        assert_eq!(window.snapshot(), vec![3, 1, 4]);
    }

    #[test]
    fn test_repeated_insert_does_not_grow() {
        let window = DedupWindow::new(2);
        for _ in 0..100 {
            window.insert("same");
        }
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_check_and_insert() {
        let window = DedupWindow::new(8);
        assert!(!window.check_and_insert(7u64));
        assert!(window.check_and_insert(7u64));
    }

    #[test]
    fn test_concurrent_inserts() {
        let window = Arc::new(DedupWindow::new(100));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        window.insert(t * 10_000 + i);
                        assert!(window.contains(&(t * 10_000 + i)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(window.len(), 100);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(cap in 1usize..64, keys in proptest::collection::vec(0u16..200, 0..500)) {
            let window = DedupWindow::new(cap);
            for k in keys {
                window.insert(k);
                prop_assert!(window.contains(&k));
                prop_assert!(window.len() <= cap);
            }
        }

        #[test]
        fn prop_last_cap_distinct_keys_retained(cap in 1usize..32, keys in proptest::collection::vec(0u16..100, 1..300)) {
            let window = DedupWindow::new(cap);
            for k in &keys {
                window.insert(*k);
            }
            let mut recent = Vec::new();
            for k in keys.iter().rev() {
                if !recent.contains(k) {
                    recent.push(*k);
                }
                if recent.len() == cap {
                    break;
                }
            }
            for k in &recent {
                prop_assert!(window.contains(k));
            }
            prop_assert_eq!(window.len(), recent.len());
        }
    }
}
