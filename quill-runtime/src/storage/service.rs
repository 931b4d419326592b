//! Storage contract used by the document runtime.

use async_trait::async_trait;
use quill_core::{SnapshotTree, Tree, TreeError, Version};
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("corrupt object {sha}: {reason}")]
    Corrupt { sha: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Result of uploading a binary attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBlobResponse {
    pub sha: String,
    pub url: String,
    pub size: u64,
}

/// Git-shaped snapshot storage for one document.
#[async_trait]
pub trait DocumentStorageService: Send + Sync {
    fn repository_url(&self) -> &str;

    /// Up to `count` versions, newest first, starting at a ref name or a
    /// commit sha.
    async fn get_versions(&self, sha: &str, count: usize) -> Result<Vec<Version>, StorageError>;

    async fn get_snapshot_tree(&self, version: &Version) -> Result<SnapshotTree, StorageError>;

    /// Bytes of the blob at `path` (slash separated) inside `version`.
    async fn get_content(&self, version: &Version, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Bytes of a blob by content hash.
    async fn read(&self, sha: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `tree` as a new commit and point `reference` at it. An empty
    /// reference means the document's own branch.
    async fn write(
        &self,
        tree: &Tree,
        parents: &[String],
        message: &str,
        reference: &str,
    ) -> Result<Version, StorageError>;

    async fn create_blob(&self, bytes: &[u8]) -> Result<CreateBlobResponse, StorageError>;

    fn get_raw_url(&self, sha: &str) -> String;
}

/// Read a blob and parse it as JSON.
pub async fn read_and_parse<T: DeserializeOwned>(
    storage: &dyn DocumentStorageService,
    sha: &str,
) -> Result<T, StorageError> {
    let bytes = storage.read(sha).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
