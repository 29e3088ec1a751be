use crate::conf::StoreConf;
use async_trait::async_trait;
use std::sync::Arc;

pub mod file;
pub mod ram;

pub use file::FileStore;
pub use ram::RamStore;

/// String key-value store backing the public key cache and the decryption
/// authorization cache.
///
/// Stores have no expiry logic; consumers decide whether a value is still usable.
/// Writes to the same key are last-writer-wins.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns `None` when the key is absent.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()>;

    /// Output some information on the store instance.
    fn info(&self) -> String;
}

/// Build the store described by `conf`.
pub async fn make_store(conf: &StoreConf) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    let store: Arc<dyn KeyValueStore> = match conf {
        StoreConf::Ram => Arc::new(RamStore::default()),
        StoreConf::File { path } => Arc::new(FileStore::new(path).await?),
    };
    tracing::info!("using key-value store {}", store.info());
    Ok(store)
}
