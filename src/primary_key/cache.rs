/// Per-key double-checked cache
///
/// Reads take the shared map lock only. A miss takes the key's own mutex,
/// re-checks, and only then runs the loader, so concurrent first access to
/// one key probes the database once while other keys proceed. A key's mutex
/// is dropped from the lock table once its value is cached.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use super::PrimaryKey;

#[derive(Debug)]
pub struct KeyedCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K, V> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> KeyedCache<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Cached value, or the loader's result stored under `key`. Loader
    /// errors are returned and nothing is cached.
    pub fn get_or_try_insert_with<E>(&self, key: &K, load: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        if let Some(v) = self.get(key) {
            return Ok(v);
        }
        let key_lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let _guard = key_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(v) = self.get(key) {
            self.release_key_lock(key, &key_lock);
            return Ok(v);
        }
        let value = match load() {
            Ok(value) => value,
            Err(e) => {
                self.release_key_lock(key, &key_lock);
                return Err(e);
            }
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), value.clone());
        self.release_key_lock(key, &key_lock);
        Ok(value)
    }

    /// Forgets `key`'s mutex unless another one has replaced it
    fn release_key_lock(&self, key: &K, key_lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|l| Arc::ptr_eq(l, key_lock)) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn invalidate(&self, key: &K) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Drops every entry whose key matches
    pub fn invalidate_where(&self, pred: impl Fn(&K) -> bool) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|k, _| !pred(k));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolved keys by table name
pub type PrimaryKeyCache = KeyedCache<String, Arc<PrimaryKey>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_loads_once() {
        let cache: KeyedCache<String, u32> = KeyedCache::new();
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = cache
                .get_or_try_insert_with(&"a".to_string(), || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(7)
                })
                .unwrap();
            assert_eq!(v, 7);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache: KeyedCache<String, u32> = KeyedCache::new();
        assert!(cache.get_or_try_insert_with(&"a".to_string(), || Err("boom")).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.lock_count(), 0);
    }

    #[test]
    fn test_concurrent_first_access() {
        let cache: Arc<KeyedCache<String, u32>> = Arc::new(KeyedCache::new());
        let loads = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loads = Arc::clone(&loads);
                thread::spawn(move || {
                    cache
                        .get_or_try_insert_with(&"t".to_string(), || {
                            loads.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(5));
                            Ok::<_, ()>(1)
                        })
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 1);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.lock_count(), 0);
    }

    #[test]
    fn test_key_locks_do_not_accumulate() {
        let cache: KeyedCache<u32, u32> = KeyedCache::new();
        for key in 0..100 {
            cache.get_or_try_insert_with(&key, || Ok::<_, ()>(key)).unwrap();
            cache.invalidate(&key);
        }
        assert_eq!(cache.lock_count(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_is_targeted() {
        let cache: KeyedCache<(String, bool), u32> = KeyedCache::new();
        cache.get_or_try_insert_with(&("a".to_string(), true), || Ok::<_, ()>(1)).unwrap();
        cache.get_or_try_insert_with(&("b".to_string(), true), || Ok::<_, ()>(2)).unwrap();
        cache.invalidate_where(|(name, _)| name == "a");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&("b".to_string(), true)), Some(2));
    }
}
