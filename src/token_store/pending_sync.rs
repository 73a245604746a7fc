use crate::domain_port::TokenStoreError;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

pub const MAX_PENDING: usize = 1_000_000;

/// Keys written locally while the remote store was unreachable.
pub struct PendingSync {
    keys: Mutex<HashSet<String>>,
    max: usize,
}

impl PendingSync {
    pub fn new(max: usize) -> Self {
        PendingSync {
            keys: Mutex::new(HashSet::new()),
            max,
        }
    }

    /// Re-enqueueing a known key always succeeds; a new key at the cap is
    /// refused.
    pub fn enqueue(&self, key: &str) -> Result<(), TokenStoreError> {
        let mut keys = self.lock();
        if keys.contains(key) {
            return Ok(());
        }
        if keys.len() >= self.max {
            return Err(TokenStoreError::CapacityExceeded(self.max));
        }
        keys.insert(key.to_string());
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn remove_all(&self, drained: &[String]) {
        let mut keys = self.lock();
        for key in drained {
            keys.remove(key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PendingSync {
    fn default() -> Self {
        PendingSync::new(MAX_PENDING)
    }
}
