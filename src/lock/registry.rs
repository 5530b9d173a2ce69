use super::keyed::KeyedLock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Reference to a registry entry, held by one request between
/// [`LockRegistry::acquire_handle`] and [`LockRegistry::release_handle`].
///
/// Handles are not `Clone`; releasing consumes the handle, so each handle is
/// released at most once.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    lock: Arc<KeyedLock>,
}

impl LockHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lock(&self) -> &Arc<KeyedLock> {
        &self.lock
    }
}

/// Map from session key to the lock serializing requests for that key.
///
/// Entries exist only while at least one request holds a handle for the key.
/// Every insert, increment, decrement and removal happens inside the same
/// mutex, so a release dropping the count to zero cannot race a concurrent
/// lookup for the same key.
#[derive(Debug)]
pub struct LockRegistry {
    fairness: bool,
    entries: Mutex<HashMap<String, Arc<KeyedLock>>>,
}

impl LockRegistry {
    pub fn new(fairness: bool) -> Self {
        Self {
            fairness,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether new locks grant their permit in arrival order
    pub fn fairness(&self) -> bool {
        self.fairness
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<KeyedLock>>> {
        // Nothing inside the critical section can leave the map half-updated.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up or create the lock for `key` and count the caller as a user.
    ///
    /// Never blocks beyond the map mutex.
    pub fn acquire_handle(&self, key: &str) -> LockHandle {
        let mut entries = self.entries();
        let lock = match entries.get(key) {
            Some(existing) => {
                let usage = existing.increment_usage();
                debug!("Reusing lock for session {} (usage {})", key, usage);
                Arc::clone(existing)
            }
            None => {
                let created = Arc::new(KeyedLock::new(self.fairness));
                entries.insert(key.to_string(), Arc::clone(&created));
                debug!("Created lock for session {}", key);
                created
            }
        };

        LockHandle {
            key: key.to_string(),
            lock,
        }
    }

    /// Give back a handle, removing the entry once nobody references it.
    ///
    /// The caller must drop any permit obtained through the handle first.
    /// A handle whose entry is missing or belongs to a different lock instance
    /// leaves the registry untouched.
    pub fn release_handle(&self, handle: LockHandle) {
        let LockHandle { key, lock } = handle;
        let mut entries = self.entries();

        let Some(current) = entries.get(&key) else {
            warn!("Released handle for session {} with no registry entry", key);
            return;
        };
        if !Arc::ptr_eq(current, &lock) {
            warn!("Released stale handle for session {}", key);
            return;
        }

        match lock.decrement_usage() {
            Some(0) => {
                entries.remove(&key);
                debug!("Removed lock for session {}", key);
            }
            Some(usage) => debug!("Released lock handle for session {} (usage {})", key, usage),
            None => {
                warn!("Lock usage for session {} already zero, removing entry", key);
                entries.remove(&key);
            }
        }
    }

    /// Current usage count for `key`, if it has an entry
    pub fn usage(&self, key: &str) -> Option<usize> {
        self.entries().get(key).map(|lock| lock.usage())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    /// Number of keys with in-flight requests
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}
