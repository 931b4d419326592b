use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use quill_core::{SnapshotTree, Tree, Version};

use super::service::{CreateBlobResponse, DocumentStorageService, StorageError};

/// Storage view that answers `read` from blobs already in memory.
///
/// Used when channels are rebuilt from trees that were never written: attach
/// snapshots and the trees produced while switching code packages.
pub struct RuntimeStorageService {
    inner: Arc<dyn DocumentStorageService>,
    blobs: HashMap<String, Vec<u8>>,
}

impl RuntimeStorageService {
    pub fn new(inner: Arc<dyn DocumentStorageService>, blobs: HashMap<String, Vec<u8>>) -> Self {
        Self { inner, blobs }
    }

    pub fn overlay_len(&self) -> usize {
        self.blobs.len()
    }
}

#[async_trait]
impl DocumentStorageService for RuntimeStorageService {
    fn repository_url(&self) -> &str {
        self.inner.repository_url()
    }

    async fn get_versions(&self, sha: &str, count: usize) -> Result<Vec<Version>, StorageError> {
        self.inner.get_versions(sha, count).await
    }

    async fn get_snapshot_tree(&self, version: &Version) -> Result<SnapshotTree, StorageError> {
        self.inner.get_snapshot_tree(version).await
    }

    async fn get_content(&self, version: &Version, path: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.get_content(version, path).await
    }

    async fn read(&self, sha: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(bytes) = self.blobs.get(sha) {
            return Ok(bytes.clone());
        }
        self.inner.read(sha).await
    }

    async fn write(
        &self,
        tree: &Tree,
        parents: &[String],
        message: &str,
        reference: &str,
    ) -> Result<Version, StorageError> {
        self.inner.write(tree, parents, message, reference).await
    }

    async fn create_blob(&self, bytes: &[u8]) -> Result<CreateBlobResponse, StorageError> {
        self.inner.create_blob(bytes).await
    }

    fn get_raw_url(&self, sha: &str) -> String {
        self.inner.get_raw_url(sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{read_and_parse, MemoryStorage};
    use quill_core::{Blob, TreeEntry};
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_overlay_serves_unwritten_blobs() {
        let backing = Arc::new(MemoryStorage::new("doc", "memory://doc"));
        let stored = backing.create_blob(b"from storage").await.unwrap();

        let mut tree = Tree::new();
        tree.push(TreeEntry::blob("header", Blob::json(&json!({"a": 1})).unwrap()));
        let mut blobs = HashMap::new();
        let snapshot = tree.to_snapshot_tree(&mut blobs).unwrap();

        let overlay = RuntimeStorageService::new(backing, blobs);
        let header: Value = read_and_parse(&overlay, snapshot.blob("header").unwrap())
            .await
            .unwrap();
        assert_eq!(header, json!({"a": 1}));
        assert_eq!(overlay.read(&stored.sha).await.unwrap(), b"from storage".to_vec());
        assert!(overlay.read("nope").await.is_err());
    }
}
