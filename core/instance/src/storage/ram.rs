use super::KeyValueStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory store, lost when dropped.
#[derive(Debug, Default)]
pub struct RamStore {
    internal_storage: RwLock<HashMap<String, String>>,
}

impl RamStore {
    pub fn len(&self) -> usize {
        self.internal_storage.read().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for RamStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let guard = self
            .internal_storage
            .read()
            .map_err(|e| anyhow::anyhow!("poisoned ram store: {e}"))?;
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        let mut guard = self
            .internal_storage
            .write()
            .map_err(|e| anyhow::anyhow!("poisoned ram store: {e}"))?;
        guard.insert(key.to_string(), value);
        Ok(())
    }

    fn info(&self) -> String {
        "RamStore".to_string()
    }
}

/// A store whose writes fail after a predetermined number of successful writes.
#[cfg(test)]
pub(crate) struct FailingRamStore {
    available_writes: std::sync::atomic::AtomicUsize,
    inner: RamStore,
}

#[cfg(test)]
impl FailingRamStore {
    pub(crate) fn new(writes_before_failure: usize) -> Self {
        Self {
            available_writes: std::sync::atomic::AtomicUsize::new(writes_before_failure),
            inner: RamStore::default(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl KeyValueStore for FailingRamStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        use std::sync::atomic::Ordering;
        let left = self.available_writes.load(Ordering::SeqCst);
        if left == 0 {
            anyhow::bail!("storage failed!")
        }
        self.available_writes.store(left - 1, Ordering::SeqCst);
        self.inner.set(key, value).await
    }

    fn info(&self) -> String {
        "FailingRamStore".to_string()
    }
}
