//! Adapters used by unit tests to simulate storage failures.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::kv::{MemoryKv, PersistenceAdapter};
use super::types::StorageError;

/// Memory adapter whose writes can be switched to fail, for every key or one.
#[derive(Debug, Default)]
pub(crate) struct FlakyKv {
    pub(crate) inner: MemoryKv,
    fail_writes: AtomicBool,
    fail_key: Mutex<Option<String>>,
    pub(crate) writes: AtomicUsize,
}

impl FlakyKv {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Fail writes to `key` only, independent of [`FlakyKv::set_failing`].
    pub(crate) fn set_failing_key(&self, key: Option<&str>) {
        *self.fail_key.lock().unwrap() = key.map(str::to_string);
    }

    fn rejects(&self, key: &str) -> bool {
        self.fail_writes.load(Ordering::SeqCst)
            || self.fail_key.lock().unwrap().as_deref() == Some(key)
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceAdapter for FlakyKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.rejects(key) {
            return Err(StorageError::Unavailable("simulated write failure".into()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        if self.rejects(key) {
            return Err(StorageError::Unavailable("simulated write failure".into()));
        }
        self.inner.remove(key).await
    }
}
