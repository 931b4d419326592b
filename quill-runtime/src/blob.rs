//! Binary attachments referenced by the document.
//!
//! Uploads go straight to storage; the metadata only joins the document once
//! the matching `blobUploaded` message is sequenced.

use std::collections::BTreeMap;
use std::sync::Arc;

use quill_core::BlobMetadata;

use crate::storage::{DocumentStorageService, StorageError};

pub struct BlobManager {
    storage: Arc<dyn DocumentStorageService>,
    blobs: BTreeMap<String, BlobMetadata>,
}

impl BlobManager {
    pub fn new(storage: Arc<dyn DocumentStorageService>) -> Self {
        Self {
            storage,
            blobs: BTreeMap::new(),
        }
    }

    /// Seed from the `.blobs` snapshot entry.
    pub fn load_blob_metadata(&mut self, blobs: Vec<BlobMetadata>) {
        for blob in blobs {
            self.add_blob(blob);
        }
    }

    /// Merge sequenced metadata. Fields already known are kept; missing ones
    /// are filled in. Returns whether the blob was new.
    pub fn add_blob(&mut self, blob: BlobMetadata) -> bool {
        match self.blobs.get_mut(&blob.sha) {
            Some(existing) => {
                existing.file_name = existing.file_name.take().or(blob.file_name);
                existing.content_type = existing.content_type.take().or(blob.content_type);
                existing.encoding = existing.encoding.take().or(blob.encoding);
                existing.url = existing.url.take().or(blob.url);
                false
            }
            None => {
                self.blobs.insert(blob.sha.clone(), blob);
                true
            }
        }
    }

    /// All known metadata, ordered by sha.
    pub fn get_blob_metadata(&self) -> Vec<BlobMetadata> {
        self.blobs.values().cloned().collect()
    }

    pub fn get(&self, sha: &str) -> Option<&BlobMetadata> {
        self.blobs.get(sha)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Upload bytes and describe them. The result is not recorded locally
    /// until sequenced.
    pub async fn create_blob(
        &self,
        bytes: &[u8],
        file_name: Option<String>,
    ) -> Result<BlobMetadata, StorageError> {
        let response = self.storage.create_blob(bytes).await?;
        log::debug!("uploaded blob {} ({} bytes)", response.sha, response.size);
        let mut metadata = BlobMetadata::new(response.sha, response.size);
        metadata.file_name = file_name;
        metadata.url = Some(response.url);
        Ok(metadata)
    }

    pub async fn get_blob(&self, sha: &str) -> Result<Vec<u8>, StorageError> {
        self.storage.read(sha).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn manager() -> BlobManager {
        BlobManager::new(Arc::new(MemoryStorage::new("doc", "memory://doc")))
    }

    #[tokio::test]
    async fn test_create_blob_uploads_without_recording() {
        let mut blobs = manager();
        let metadata = blobs
            .create_blob(b"image bytes", Some("a.png".into()))
            .await
            .unwrap();

        assert_eq!(metadata.size, 11);
        assert_eq!(metadata.file_name.as_deref(), Some("a.png"));
        assert!(metadata.url.as_deref().unwrap().ends_with(&metadata.sha));
        assert!(blobs.is_empty());

        assert!(blobs.add_blob(metadata.clone()));
        assert_eq!(blobs.get_blob(&metadata.sha).await.unwrap(), b"image bytes");
    }

    #[test]
    fn test_add_blob_merges_missing_fields() {
        let mut blobs = manager();
        let mut first = BlobMetadata::new("abc", 3);
        first.file_name = Some("keep.txt".into());
        assert!(blobs.add_blob(first));

        let mut second = BlobMetadata::new("abc", 3);
        second.file_name = Some("other.txt".into());
        second.url = Some("memory://doc/blobs/abc".into());
        assert!(!blobs.add_blob(second));

        let merged = blobs.get("abc").unwrap();
        assert_eq!(merged.file_name.as_deref(), Some("keep.txt"));
        assert_eq!(merged.url.as_deref(), Some("memory://doc/blobs/abc"));
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    fn test_metadata_is_sorted_by_sha() {
        let mut blobs = manager();
        blobs.load_blob_metadata(vec![BlobMetadata::new("b", 1), BlobMetadata::new("a", 2)]);
        let shas: Vec<_> = blobs.get_blob_metadata().into_iter().map(|b| b.sha).collect();
        assert_eq!(shas, vec!["a", "b"]);
    }
}
