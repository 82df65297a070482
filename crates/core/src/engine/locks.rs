//! Per-path single-writer locks
//!
//! Waiters on a tokio mutex are served first come, first served, so
//! sessions for one path run in the order they asked for the lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default, Clone)]
pub struct PathLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl PathLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`
    pub async fn lock(&self, path: &str) -> PathGuard {
        // Same lock for paths that differ only in case
        let key = path.to_ascii_lowercase();
        let mutex = self.locks.lock().entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        PathGuard {
            guard: Some(guard),
            key,
            locks: self.locks.clone(),
        }
    }

    /// Paths with a held or awaited lock
    #[must_use]
    pub fn active(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Held for the whole session; frees the map entry when nobody else waits
pub struct PathGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        drop(self.guard.take());
        if let Some(mutex) = locks.get(&self.key) {
            // Only the map still holds it
            if Arc::strong_count(mutex) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}
