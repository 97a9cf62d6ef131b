use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = Arc<SyncMutex<HashMap<String, Arc<Mutex<()>>>>>;

/// One async mutex per key, created on first use and dropped again once
/// nobody holds or waits for it.
///
/// The outer map is only held long enough to find, insert or remove the
/// key's mutex, so holders of different keys never wait on each other.
#[derive(Default)]
pub struct KeyedLocks {
    locks: LockMap,
}

/// Exclusive access to one key. Releasing the last guard (or abandoning the
/// last wait) for a key removes its entry.
pub struct KeyGuard {
    // Field order matters: the mutex guard must be released before the
    // entry checks whether anyone else still references the mutex.
    _guard: OwnedMutexGuard<()>,
    _entry: Entry,
}

struct Entry {
    key: String,
    mutex: Arc<Mutex<()>>,
    locks: LockMap,
}

impl Drop for Entry {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones are only handed out under the map lock, so the map's copy
        // plus ours means there is no other holder or waiter.
        let unused = locks.get(&self.key).is_some_and(|current| {
            Arc::ptr_eq(current, &self.mutex) && Arc::strong_count(current) == 2
        });
        if unused {
            locks.remove(&self.key);
        }
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Entry {
                key: key.to_string(),
                mutex: Arc::clone(locks.entry(key.to_string()).or_default()),
                locks: Arc::clone(&self.locks),
            }
        };
        let guard = Arc::clone(&entry.mutex).lock_owned().await;
        KeyGuard {
            _guard: guard,
            _entry: entry,
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
