use crate::error::{Result, VellumError};
use crate::key::BlobKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

const PRUNE_THRESHOLD: usize = 1024;

/// Per-key async read/write locks. Readers of a key share it, writers hold it
/// alone, and holders of different keys never wait on each other.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Weak<RwLock<()>>>>,
}

pub type KeyReadGuard = OwnedRwLockReadGuard<()>;
pub type KeyWriteGuard = OwnedRwLockWriteGuard<()>;

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self, key: &BlobKey) -> Result<KeyReadGuard> {
        Ok(self.entry(key)?.read_owned().await)
    }

    pub async fn write(&self, key: &BlobKey) -> Result<KeyWriteGuard> {
        Ok(self.entry(key)?.write_owned().await)
    }

    fn entry(&self, key: &BlobKey) -> Result<Arc<RwLock<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| VellumError::Internal("key lock table poisoned".to_string()))?;

        if locks.len() >= PRUNE_THRESHOLD {
            locks.retain(|_, lock| lock.strong_count() > 0);
        }

        match locks.get(key.as_str()).and_then(Weak::upgrade) {
            Some(lock) => Ok(lock),
            None => {
                let lock = Arc::new(RwLock::new(()));
                locks.insert(key.to_string(), Arc::downgrade(&lock));
                Ok(lock)
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }
}
