//! Downloaded episode audio, keyed by episode id.

pub mod download;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::app::Result;

pub use download::{DownloadProgress, Downloader};

#[derive(Debug, Clone, PartialEq)]
pub struct MediaBlob {
    pub content_type: String,
    pub body: Vec<u8>,
    /// Hex SHA-256 of `body`.
    pub digest: String,
    pub stored_at: DateTime<Utc>,
}

impl MediaBlob {
    pub fn new(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        let digest = hex::encode(Sha256::digest(&body));
        Self {
            content_type: content_type.into(),
            body,
            digest,
            stored_at: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn put(&self, episode_id: &str, blob: MediaBlob) -> Result<()>;

    async fn get(&self, episode_id: &str) -> Result<Option<MediaBlob>>;

    /// Returns whether a blob was removed.
    async fn delete(&self, episode_id: &str) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<String>>;

    async fn contains(&self, episode_id: &str) -> Result<bool> {
        Ok(self.get(episode_id).await?.is_some())
    }
}

/// Process-local media store.
#[derive(Default)]
pub struct MemoryMediaStore {
    blobs: RwLock<BTreeMap<String, MediaBlob>>,
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn put(&self, episode_id: &str, blob: MediaBlob) -> Result<()> {
        self.blobs.write().await.insert(episode_id.to_string(), blob);
        Ok(())
    }

    async fn get(&self, episode_id: &str) -> Result<Option<MediaBlob>> {
        Ok(self.blobs.read().await.get(episode_id).cloned())
    }

    async fn delete(&self, episode_id: &str) -> Result<bool> {
        Ok(self.blobs.write().await.remove(episode_id).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }
}
