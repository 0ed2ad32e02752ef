//! Per-key mutual exclusion
//!
//! Every operation on one `(entityType, entityID)` runs while holding that
//! key's mutex, so appends, reductions and projections for the same
//! aggregate are serialized. Different keys get different mutexes and never
//! wait on each other. Entries are removed as soon as nobody holds or waits
//! for them, so the table only grows with the number of keys in flight.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

/// A table of lazily created mutexes, one per key
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` while holding the lock for `key`
    pub fn with_lock<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let result = {
            let _guard = slot.lock();
            f()
        };

        self.release(key, slot);
        result
    }

    /// Number of keys currently held or waited on
    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }

    fn release(&self, key: &K, slot: Arc<Mutex<()>>) {
        let mut slots = self.slots.lock();
        drop(slot);
        // Only the table's own reference left: nobody holds or waits.
        if slots
            .get(key)
            .map(|entry| Arc::strong_count(entry) == 1)
            .unwrap_or(false)
        {
            slots.remove(key);
        }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyedLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..50 {
                        locks.with_lock(&"Post/1".to_string(), || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[test]
    fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let value = locks.with_lock(&"a".to_string(), || {
            // Re-entering with another key must not deadlock.
            locks.with_lock(&"b".to_string(), || 42)
        });
        assert_eq!(value, 42);
        assert_eq!(locks.active_keys(), 0);
    }
}
