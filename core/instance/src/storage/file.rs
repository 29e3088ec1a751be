use super::KeyValueStore;
use crate::anyhow_error_and_log;
use async_trait::async_trait;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// Store keeping one file per key under a root directory.
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create the store rooted at `path`. All missing directories are created.
    pub async fn new(path: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(path).await.map_err(|e| {
            tracing::warn!("Could not create directory {}: {}", path.display(), e);
            e
        })?;
        Ok(Self {
            path: tokio::fs::canonicalize(path).await?,
        })
    }

    pub fn root_dir(&self) -> &Path {
        self.path.as_path()
    }

    fn key_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.is_empty() || key.contains(MAIN_SEPARATOR) || key.contains('/') || key.starts_with('.') {
            return Err(anyhow_error_and_log(format!(
                "invalid store key {key:?}, keys must be non-empty file names"
            )));
        }
        Ok(self.path.join(format!("{key}.json")))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.key_path(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        let path = self.key_path(key)?;
        // write to a sibling file first so readers never observe a partial value
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn info(&self) -> String {
        format!("FileStore({})", self.path.display())
    }
}
