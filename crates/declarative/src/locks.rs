//! Per-key mutual exclusion
//!
//! Two tasks touching the same key must not interleave their
//! read-diff-apply sequences, while tasks on disjoint keys run freely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::ResourceKey;

/// Registry of one lock per resource key
///
/// Entries are created on first use and dropped again once nobody holds
/// or waits for them, so the map only grows with concurrently used keys.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<ResourceKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`
    ///
    /// Callers hold at most one key lock at a time, which keeps the
    /// registry free of lock-order cycles.
    pub fn with_key<R, F>(&self, key: &ResourceKey, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let lock = self.entry(key);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        self.release(key, lock);
        result
    }

    /// Number of keys currently held or waited on
    pub fn active(&self) -> usize {
        self.registry().len()
    }

    fn entry(&self, key: &ResourceKey) -> Arc<Mutex<()>> {
        Arc::clone(self.registry().entry(key.clone()).or_default())
    }

    fn release(&self, key: &ResourceKey, lock: Arc<Mutex<()>>) {
        let mut registry = self.registry();
        // The map holds one reference and `lock` the other
        if Arc::strong_count(&lock) == 2 {
            registry.remove(key);
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ResourceKey, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
