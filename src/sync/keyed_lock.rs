//! Per-key mutual exclusion with refcounted cleanup.
//!
//! Entries are created on first acquisition and removed when the last
//! holder releases, so the map never grows with dead keys. The lock is
//! NON-REENTRANT: acquiring the same key from within a critical section
//! on that key deadlocks. Callers must never nest acquisitions on one
//! key; `session::launcher` documents this contract and a regression
//! test asserts the deadlock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
pub struct KeyedLocks {
    entries: StdMutex<HashMap<String, Entry>>,
}

struct Entry {
    lock: Arc<AsyncMutex<()>>,
    refs: usize,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` while holding the lock for `key`. Operations on the
    /// same key serialize in acquisition order; different keys run in
    /// parallel.
    pub async fn with_lock<F, T>(&self, key: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self.retain(key);
        let _release = ReleaseGuard { locks: self, key };
        let _guard = lock.lock().await;
        work.await
    }

    fn retain(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            lock: Arc::new(AsyncMutex::new(())),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.lock)
    }

    fn release(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn live_keys(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Decrements the refcount even when the critical section panics.
struct ReleaseGuard<'a> {
    locks: &'a KeyedLocks,
    key: &'a str,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(self.key);
    }
}
