//! In-memory snapshot store.
//!
//! Objects are content addressed by SHA-256, git style:
//!
//! ```text
//! refs["doc"] ──► commit{tree, parents, message}
//!                   │
//!                   ▼
//!                 tree{entries: path → (mode, kind, sha)}
//!                   │
//!                   ├──► blob (LZ4, size-prepended)
//!                   └──► tree …
//! ```
//!
//! Blob bodies are stored LZ4-compressed; hashes are over the uncompressed
//! bytes so identical content always dedups.
//!
//! Performance targets:
//! - Write 1KB blob: <20μs (hash + LZ4)
//! - Read 1KB blob: <10μs

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use quill_core::{content_hash, FileMode, SnapshotTree, Tree, TreeValue, Version};
use serde::{Deserialize, Serialize};

use super::service::{CreateBlobResponse, DocumentStorageService, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    path: String,
    mode: FileMode,
    kind: ObjectKind,
    sha: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredTree {
    entries: Vec<StoredEntry>,
}

#[derive(Serialize)]
struct CommitBody<'a> {
    tree: &'a str,
    parents: &'a [String],
    message: &'a str,
}

/// LZ4-compressed blob body.
#[derive(Debug, Clone)]
struct CompressedBlob {
    original_size: u64,
    compressed: Vec<u8>,
}

impl CompressedBlob {
    fn compress(data: &[u8]) -> Self {
        Self {
            original_size: data.len() as u64,
            compressed: lz4_flex::compress_prepend_size(data),
        }
    }

    fn decompress(&self, sha: &str) -> Result<Vec<u8>, StorageError> {
        lz4_flex::decompress_size_prepended(&self.compressed).map_err(|e| StorageError::Corrupt {
            sha: sha.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    blobs: HashMap<String, CompressedBlob>,
    trees: HashMap<String, StoredTree>,
    commits: HashMap<String, Version>,
    refs: HashMap<String, String>,
}

/// Object counts and byte totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub blob_count: usize,
    pub tree_count: usize,
    pub commit_count: usize,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
}

/// Snapshot storage for one document, held in memory.
pub struct MemoryStorage {
    document_id: String,
    repository_url: String,
    state: RwLock<MemoryState>,
}

impl MemoryStorage {
    pub fn new(document_id: impl Into<String>, repository_url: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            repository_url: repository_url.into(),
            state: RwLock::new(MemoryState::default()),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Commit sha a ref currently points at.
    pub fn resolve_ref(&self, reference: &str) -> Option<String> {
        let state = self.read_state().ok()?;
        state.refs.get(self.ref_name(reference)).cloned()
    }

    pub fn stats(&self) -> StorageStats {
        let Ok(state) = self.read_state() else {
            return StorageStats::default();
        };
        StorageStats {
            blob_count: state.blobs.len(),
            tree_count: state.trees.len(),
            commit_count: state.commits.len(),
            original_bytes: state.blobs.values().map(|b| b.original_size).sum(),
            compressed_bytes: state.blobs.values().map(|b| b.compressed.len() as u64).sum(),
        }
    }

    fn ref_name<'a>(&'a self, reference: &'a str) -> &'a str {
        if reference.is_empty() {
            &self.document_id
        } else {
            reference
        }
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, MemoryState>, StorageError> {
        self.state
            .read()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".into()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, StorageError> {
        self.state
            .write()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".into()))
    }
}

// ─── Object helpers ─────────────────────────────────────────

fn store_blob(state: &mut MemoryState, bytes: &[u8]) -> String {
    let sha = content_hash(bytes);
    state
        .blobs
        .entry(sha.clone())
        .or_insert_with(|| CompressedBlob::compress(bytes));
    sha
}

fn store_tree(state: &mut MemoryState, tree: &Tree) -> Result<String, StorageError> {
    let mut stored = StoredTree::default();
    for entry in &tree.entries {
        let (kind, sha) = match &entry.value {
            TreeValue::Blob(blob) => (ObjectKind::Blob, store_blob(state, &blob.to_bytes()?)),
            TreeValue::Tree(sub) => (ObjectKind::Tree, store_tree(state, sub)?),
            TreeValue::Commit(sha) => (ObjectKind::Commit, sha.clone()),
        };
        stored.entries.push(StoredEntry {
            path: entry.path.clone(),
            mode: entry.mode,
            kind,
            sha,
        });
    }
    let sha = content_hash(&serde_json::to_vec(&stored)?);
    state.trees.insert(sha.clone(), stored);
    Ok(sha)
}

fn load_tree(state: &MemoryState, sha: &str) -> Result<SnapshotTree, StorageError> {
    let stored = state
        .trees
        .get(sha)
        .ok_or_else(|| StorageError::NotFound(sha.to_string()))?;
    let mut snapshot = SnapshotTree {
        sha: Some(sha.to_string()),
        ..Default::default()
    };
    for entry in &stored.entries {
        match entry.kind {
            ObjectKind::Blob => {
                snapshot.blobs.insert(entry.path.clone(), entry.sha.clone());
            }
            ObjectKind::Tree => {
                snapshot
                    .trees
                    .insert(entry.path.clone(), load_tree(state, &entry.sha)?);
            }
            ObjectKind::Commit => {
                snapshot.commits.insert(entry.path.clone(), entry.sha.clone());
            }
        }
    }
    Ok(snapshot)
}

fn read_blob(state: &MemoryState, sha: &str) -> Result<Vec<u8>, StorageError> {
    state
        .blobs
        .get(sha)
        .ok_or_else(|| StorageError::NotFound(sha.to_string()))?
        .decompress(sha)
}

#[async_trait]
impl DocumentStorageService for MemoryStorage {
    fn repository_url(&self) -> &str {
        &self.repository_url
    }

    async fn get_versions(&self, sha: &str, count: usize) -> Result<Vec<Version>, StorageError> {
        let state = self.read_state()?;
        let name = self.ref_name(sha);
        let mut next = match state.refs.get(name) {
            Some(head) => Some(head.clone()),
            None if state.commits.contains_key(name) => Some(name.to_string()),
            None => None,
        };

        let mut versions = Vec::new();
        while let Some(commit_sha) = next.take() {
            if versions.len() >= count {
                break;
            }
            let Some(version) = state.commits.get(&commit_sha) else {
                break;
            };
            next = version.parents.first().cloned();
            versions.push(version.clone());
        }
        Ok(versions)
    }

    async fn get_snapshot_tree(&self, version: &Version) -> Result<SnapshotTree, StorageError> {
        let state = self.read_state()?;
        load_tree(&state, &version.tree)
    }

    async fn get_content(&self, version: &Version, path: &str) -> Result<Vec<u8>, StorageError> {
        let state = self.read_state()?;
        let mut tree_sha = version.tree.clone();
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();

        while let Some(segment) = segments.next() {
            let tree = state
                .trees
                .get(&tree_sha)
                .ok_or_else(|| StorageError::NotFound(tree_sha.clone()))?;
            let entry = tree
                .entries
                .iter()
                .find(|e| e.path == segment)
                .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
            match (entry.kind, segments.peek().is_some()) {
                (ObjectKind::Blob, false) => return read_blob(&state, &entry.sha),
                (ObjectKind::Tree, true) => tree_sha = entry.sha.clone(),
                _ => break,
            }
        }
        Err(StorageError::NotFound(path.to_string()))
    }

    async fn read(&self, sha: &str) -> Result<Vec<u8>, StorageError> {
        let state = self.read_state()?;
        read_blob(&state, sha)
    }

    async fn write(
        &self,
        tree: &Tree,
        parents: &[String],
        message: &str,
        reference: &str,
    ) -> Result<Version, StorageError> {
        let mut state = self.write_state()?;
        let tree_sha = store_tree(&mut state, tree)?;
        let body = CommitBody {
            tree: &tree_sha,
            parents,
            message,
        };
        let sha = content_hash(&serde_json::to_vec(&body)?);
        let version = Version {
            sha: sha.clone(),
            tree: tree_sha,
            message: message.to_string(),
            parents: parents.to_vec(),
        };
        state.commits.insert(sha.clone(), version.clone());
        state
            .refs
            .insert(self.ref_name(reference).to_string(), sha.clone());
        log::debug!(
            "{}: committed {} to {}",
            self.document_id,
            sha.get(..12).unwrap_or(&sha),
            self.ref_name(reference)
        );
        Ok(version)
    }

    async fn create_blob(&self, bytes: &[u8]) -> Result<CreateBlobResponse, StorageError> {
        let sha = {
            let mut state = self.write_state()?;
            store_blob(&mut state, bytes)
        };
        Ok(CreateBlobResponse {
            url: self.get_raw_url(&sha),
            sha,
            size: bytes.len() as u64,
        })
    }

    fn get_raw_url(&self, sha: &str) -> String {
        format!("{}/blobs/{}", self.repository_url, sha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{Blob, TreeEntry};

    fn sample_tree(body: &str) -> Tree {
        let mut inner = Tree::new();
        inner.push(TreeEntry::blob("header", Blob::utf8(body)));

        let mut root = Tree::new();
        root.push(TreeEntry::blob(".attributes", Blob::utf8("{\"seq\":1}")));
        root.push(TreeEntry::tree("root", inner));
        root.push(TreeEntry::commit("text", "feedface"));
        root
    }

    #[tokio::test]
    async fn test_write_then_read_snapshot_tree() {
        let storage = MemoryStorage::new("doc", "memory://doc");
        let version = storage.write(&sample_tree("hello"), &[], "first", "").await.unwrap();

        let tree = storage.get_snapshot_tree(&version).await.unwrap();
        assert_eq!(tree.sha.as_deref(), Some(version.tree.as_str()));
        assert_eq!(tree.commits["text"], "feedface");

        let header_sha = tree.trees["root"].blob("header").unwrap();
        assert_eq!(storage.read(header_sha).await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_versions_follow_first_parent() {
        let storage = MemoryStorage::new("doc", "memory://doc");
        let v1 = storage.write(&sample_tree("a"), &[], "one", "").await.unwrap();
        let v2 = storage
            .write(&sample_tree("b"), &[v1.sha.clone()], "two", "")
            .await
            .unwrap();

        let versions = storage.get_versions("doc", 5).await.unwrap();
        assert_eq!(versions, vec![v2.clone(), v1.clone()]);

        let latest = storage.get_versions("", 1).await.unwrap();
        assert_eq!(latest, vec![v2]);

        let by_sha = storage.get_versions(&v1.sha, 1).await.unwrap();
        assert_eq!(by_sha, vec![v1]);
    }

    #[tokio::test]
    async fn test_unknown_ref_has_no_versions() {
        let storage = MemoryStorage::new("doc", "memory://doc");
        assert!(storage.get_versions("missing", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_content_by_path() {
        let storage = MemoryStorage::new("doc", "memory://doc");
        let version = storage.write(&sample_tree("nested"), &[], "m", "").await.unwrap();

        assert_eq!(
            storage.get_content(&version, "root/header").await.unwrap(),
            b"nested".to_vec()
        );
        assert!(matches!(
            storage.get_content(&version, "root/missing").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(storage.get_content(&version, "root").await.is_err());
    }

    #[tokio::test]
    async fn test_create_blob_dedups_and_compresses() {
        let storage = MemoryStorage::new("doc", "memory://doc");
        let payload = vec![b'z'; 4096];
        let first = storage.create_blob(&payload).await.unwrap();
        let second = storage.create_blob(&payload).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.size, 4096);
        assert_eq!(first.url, format!("memory://doc/blobs/{}", first.sha));

        let stats = storage.stats();
        assert_eq!(stats.blob_count, 1);
        assert_eq!(stats.original_bytes, 4096);
        assert!(stats.compressed_bytes < stats.original_bytes);
    }

    #[tokio::test]
    async fn test_named_refs_are_independent() {
        let storage = MemoryStorage::new("doc", "memory://doc");
        let main = storage.write(&sample_tree("m"), &[], "main", "").await.unwrap();
        let side = storage.write(&sample_tree("s"), &[], "side", "doc/text").await.unwrap();

        assert_eq!(storage.resolve_ref(""), Some(main.sha));
        assert_eq!(storage.resolve_ref("doc/text"), Some(side.sha));
    }
}
