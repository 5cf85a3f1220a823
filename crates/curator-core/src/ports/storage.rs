//! Object storage port (receiving buckets, preservation tiers, cold tier).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("no such key: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("conflict on {bucket}/{key}: {reason}")]
    Conflict {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("storage i/o: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPage {
    pub objects: Vec<ObjectInfo>,
    /// Continuation token; `None` on the last page.
    pub next_token: Option<String>,
}

/// Cold-tier restore state reported by `head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreState {
    /// Hot object, or cold object already restored.
    #[default]
    Available,
    /// Cold object with no restore request.
    Archived,
    /// Restore requested and still running.
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub info: ObjectInfo,
    pub restore: RestoreState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalTier {
    Expedited,
    Standard,
    Bulk,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        page_size: usize,
        token: Option<&str>,
    ) -> Result<ObjectPage, StorageError>;

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, StorageError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Stores `data`; returns the new etag.
    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<String, StorageError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// `Conflict` means a restore request is already running.
    async fn request_restore(
        &self,
        bucket: &str,
        key: &str,
        tier: RetrievalTier,
        days: u32,
    ) -> Result<(), StorageError>;
}
