//! Keyed cache with dual strong/weak references. Entries stay strongly held
//! while hot; the sweep demotes them to weak references, after which the
//! entry answers lookups only as long as someone else still holds the value.
//! Two concurrent lookups of the same key always yield the same underlying
//! allocation — callers rely on that identity for memoization.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use tracing::trace;

struct Entry<V> {
    last_use: u64,
    strong: Option<Arc<V>>,
    weak: Weak<V>,
}

impl<V> Entry<V> {
    fn new(value: Arc<V>, now: u64) -> Self {
        Self {
            last_use: now,
            weak: Arc::downgrade(&value),
            strong: Some(value),
        }
    }

    fn lock(&self) -> Option<Arc<V>> {
        match &self.strong {
            Some(value) => Some(Arc::clone(value)),
            None => self.weak.upgrade(),
        }
    }

    fn is_expired(&self) -> bool {
        self.strong.is_none() && self.weak.strong_count() == 0
    }
}

/// A bounded hot table over a lookup-only weak table, behind one mutex.
pub struct TaggedCache<K, V> {
    name: &'static str,
    target_size: usize,
    target_age: u64,
    inner: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash, V> TaggedCache<K, V> {
    /// `target_size` of zero means size is not enforced; `target_age` is the
    /// maximum idle seconds before an entry is demoted to weak.
    pub fn new(name: &'static str, target_size: usize, target_age: u64) -> Self {
        Self {
            name,
            target_size,
            target_age,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch and touch. A hit on a weakly held entry re-promotes it.
    pub fn fetch(&self, key: &K, now: u64) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(key)?;
        let value = entry.lock()?;
        entry.last_use = now;
        entry.strong = Some(Arc::clone(&value));
        Some(value)
    }

    /// Store a value, returning the shared handle. If the key is already
    /// present the existing allocation wins and is returned instead.
    pub fn store(&self, key: K, value: V, now: u64) -> Arc<V> {
        let mut candidate = Arc::new(value);
        self.canonicalize(key, &mut candidate, now);
        candidate
    }

    /// Replace `value` with the cached allocation for `key` if one exists;
    /// otherwise cache `value`. Returns true when an existing allocation was
    /// substituted.
    pub fn canonicalize(&self, key: K, value: &mut Arc<V>, now: u64) -> bool {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(&key) {
            if let Some(existing) = entry.lock() {
                entry.last_use = now;
                entry.strong = Some(Arc::clone(&existing));
                *value = existing;
                return true;
            }
        }
        inner.insert(key, Entry::new(Arc::clone(value), now));
        false
    }

    /// Refresh an entry's last-use stamp. Returns false if the key is gone.
    pub fn touch(&self, key: &K, now: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.last_use = now;
                true
            }
            _ => false,
        }
    }

    /// Drop an entry. Returns true if it was present.
    pub fn del(&self, key: &K) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Strongly held entry count.
    pub fn cache_size(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|e| e.strong.is_some())
            .count()
    }

    /// Total tracked entries, weak included.
    pub fn track_size(&self) -> usize {
        self.inner.lock().len()
    }

    /// Demote entries past the target age to weak references, shrink the hot
    /// table toward the target size (oldest first), and drop entries whose
    /// values have gone away entirely.
    pub fn sweep(&self, now: u64) {
        let mut inner = self.inner.lock();
        let before = inner.len();

        for entry in inner.values_mut() {
            if entry.strong.is_some() && now.saturating_sub(entry.last_use) > self.target_age {
                entry.strong = None;
            }
        }

        if self.target_size > 0 {
            let hot: usize = inner.values().filter(|e| e.strong.is_some()).count();
            if hot > self.target_size {
                let mut stamps: Vec<u64> = inner
                    .values()
                    .filter(|e| e.strong.is_some())
                    .map(|e| e.last_use)
                    .collect();
                stamps.sort_unstable();
                let cutoff = stamps[hot - self.target_size - 1];
                for entry in inner.values_mut() {
                    if entry.strong.is_some() && entry.last_use <= cutoff {
                        entry.strong = None;
                    }
                }
            }
        }

        inner.retain(|_, entry| !entry.is_expired());
        trace!(
            cache = self.name,
            before,
            after = inner.len(),
            "cache swept"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> TaggedCache<u32, String> {
        TaggedCache::new("test", 2, 10)
    }

    #[test]
    fn store_then_fetch_yields_same_allocation() {
        let c = cache();
        let stored = c.store(1, "one".to_string(), 0);
        let fetched = c.fetch(&1, 1).unwrap();
        assert!(Arc::ptr_eq(&stored, &fetched));
    }

    #[test]
    fn canonicalize_preserves_identity() {
        let c = cache();
        let first = c.store(1, "one".to_string(), 0);
        let mut second = Arc::new("one-again".to_string());
        assert!(c.canonicalize(1, &mut second, 0));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn sweep_demotes_idle_entries_but_live_handles_survive() {
        let c = cache();
        let held = c.store(1, "held".to_string(), 0);
        c.store(2, "dropped".to_string(), 0);
        // Both entries idle past the target age.
        c.sweep(20);
        assert_eq!(c.cache_size(), 0);
        // The externally held value is still reachable through the weak side.
        assert!(c.fetch(&1, 21).is_some());
        assert!(c.fetch(&2, 21).is_none());
        drop(held);
    }

    #[test]
    fn sweep_enforces_target_size() {
        let c = cache();
        c.store(1, "a".to_string(), 0);
        c.store(2, "b".to_string(), 1);
        c.store(3, "c".to_string(), 2);
        c.sweep(3);
        assert!(c.cache_size() <= 2);
        // The most recent entry is still hot.
        assert!(c.fetch(&3, 3).is_some());
    }

    #[test]
    fn del_removes_entries() {
        let c = cache();
        c.store(1, "one".to_string(), 0);
        assert!(c.del(&1));
        assert!(!c.del(&1));
        assert!(c.fetch(&1, 0).is_none());
    }
}
