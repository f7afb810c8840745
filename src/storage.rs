//! Storage collaborator.
//!
//! The orchestrator reads the uploaded source once per run and writes one
//! output per completed job. Both calls are single attempts; failures come
//! back as [`Error::Storage`] so a failed output write stays local to its job.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use vf_core::config::StorageConfig;
use vf_core::{Error, Result};

/// Object storage for source media and converted outputs.
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Read the object at `path`.
    async fn fetch(&self, path: &str) -> Result<Bytes>;

    /// Write `data` to `path` and return its public url.
    async fn store(&self, path: &str, data: Bytes) -> Result<String>;
}

/// Storage rooted at a local directory.
///
/// Storage paths are relative, `/`-separated keys such as
/// `<user_id>/movie.mp4`. Public urls are `<public_base_url>/<path>`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.root.clone(), config.public_base_url.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Public url for a storage path.
    pub fn public_url(&self, path: &str) -> String {
        let base = self.public_base_url.trim_end_matches('/');
        if base.is_empty() {
            path.to_string()
        } else {
            format!("{base}/{path}")
        }
    }

    /// Resolve a storage path to a file under the root.
    ///
    /// Empty, absolute, and parent-relative paths are rejected.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Err(Error::Validation("storage path is empty".into()));
        }
        let rel = Path::new(path);
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "storage path must be relative and stay under the root: {path}"
                    )));
                }
            }
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl MediaStorage for LocalStorage {
    async fn fetch(&self, path: &str) -> Result<Bytes> {
        let file = self.resolve(path)?;
        let data = tokio::fs::read(&file)
            .await
            .map_err(|e| Error::Storage(format!("failed to read {path}: {e}")))?;
        tracing::debug!(path, bytes = data.len(), "fetched object");
        Ok(Bytes::from(data))
    }

    async fn store(&self, path: &str, data: Bytes) -> Result<String> {
        let file = self.resolve(path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("failed to create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&file, &data)
            .await
            .map_err(|e| Error::Storage(format!("failed to write {path}: {e}")))?;
        tracing::debug!(path, bytes = data.len(), "stored object");
        Ok(self.public_url(path))
    }
}
