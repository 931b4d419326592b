//! Snapshot trees and versions.
//!
//! A snapshot is written as a [`Tree`] (entries carry inline blob bodies) and
//! read back as a [`SnapshotTree`] (entries carry content hashes). Storage is
//! git-shaped: blobs, trees and commits addressed by SHA-256 of their bytes.
//!
//! ```text
//! Tree (write side)                 SnapshotTree (read side)
//! ├── .attributes  blob{…}   ──►    blobs:   .attributes → 9f2c…
//! ├── quorum       blob{…}          trees:   root → { blobs: … }
//! ├── root         tree{…}          commits: text → 41ab…
//! └── text         commit 41ab…
//! ```

use std::collections::{BTreeMap, HashMap};

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Git-style entry mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileMode {
    #[serde(rename = "100644")]
    File,
    #[serde(rename = "100755")]
    Executable,
    #[serde(rename = "040000")]
    Directory,
    #[serde(rename = "160000")]
    Commit,
    #[serde(rename = "120000")]
    Symlink,
}

/// How a blob body is encoded inside JSON.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// Inline blob body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub contents: String,
    #[serde(default)]
    pub encoding: Encoding,
}

impl Blob {
    pub fn utf8(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            encoding: Encoding::Utf8,
        }
    }

    /// JSON-serialize `value` into a utf-8 blob.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::utf8(serde_json::to_string(value)?))
    }

    /// Base64-encode arbitrary bytes.
    pub fn binary(bytes: &[u8]) -> Self {
        Self {
            contents: base64::engine::general_purpose::STANDARD.encode(bytes),
            encoding: Encoding::Base64,
        }
    }

    /// Decoded bytes of the blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TreeError> {
        match self.encoding {
            Encoding::Utf8 => Ok(self.contents.as_bytes().to_vec()),
            Encoding::Base64 => Ok(base64::engine::general_purpose::STANDARD.decode(&self.contents)?),
        }
    }
}

/// Value held by a tree entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum TreeValue {
    Blob(Blob),
    Tree(Tree),
    /// SHA of a commit stored elsewhere (submodule)
    Commit(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub mode: FileMode,
    #[serde(flatten)]
    pub value: TreeValue,
}

impl TreeEntry {
    pub fn blob(path: impl Into<String>, blob: Blob) -> Self {
        Self {
            path: path.into(),
            mode: FileMode::File,
            value: TreeValue::Blob(blob),
        }
    }

    pub fn tree(path: impl Into<String>, tree: Tree) -> Self {
        Self {
            path: path.into(),
            mode: FileMode::Directory,
            value: TreeValue::Tree(tree),
        }
    }

    pub fn commit(path: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: FileMode::Commit,
            value: TreeValue::Commit(sha.into()),
        }
    }
}

/// Write-side snapshot tree with inline contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TreeEntry) {
        self.entries.push(entry);
    }

    pub fn entry(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Inline blob stored directly under `path`.
    pub fn blob(&self, path: &str) -> Option<&Blob> {
        match self.entry(path).map(|e| &e.value) {
            Some(TreeValue::Blob(blob)) => Some(blob),
            _ => None,
        }
    }

    /// Flatten into a content-addressed [`SnapshotTree`].
    ///
    /// Every blob body is hashed and recorded in `blobs` so that a storage
    /// overlay can serve it without a round trip.
    pub fn to_snapshot_tree(
        &self,
        blobs: &mut HashMap<String, Vec<u8>>,
    ) -> Result<SnapshotTree, TreeError> {
        let mut snapshot = SnapshotTree::default();
        for entry in &self.entries {
            match &entry.value {
                TreeValue::Blob(blob) => {
                    let bytes = blob.to_bytes()?;
                    let sha = content_hash(&bytes);
                    blobs.insert(sha.clone(), bytes);
                    snapshot.blobs.insert(entry.path.clone(), sha);
                }
                TreeValue::Tree(sub) => {
                    let child = sub.to_snapshot_tree(blobs)?;
                    snapshot.trees.insert(entry.path.clone(), child);
                }
                TreeValue::Commit(sha) => {
                    snapshot.commits.insert(entry.path.clone(), sha.clone());
                }
            }
        }
        Ok(snapshot)
    }
}

/// Read-side snapshot tree: paths map to content hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTree {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(default)]
    pub blobs: BTreeMap<String, String>,
    #[serde(default)]
    pub commits: BTreeMap<String, String>,
    #[serde(default)]
    pub trees: BTreeMap<String, SnapshotTree>,
}

impl SnapshotTree {
    pub fn blob(&self, path: &str) -> Option<&str> {
        self.blobs.get(path).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty() && self.commits.is_empty() && self.trees.is_empty()
    }
}

/// A committed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// Commit hash
    pub sha: String,
    /// Root tree hash
    pub tree: String,
    pub message: String,
    #[serde(default)]
    pub parents: Vec<String>,
}

/// SHA-256 content address, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("invalid base64 blob: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Tree {
        let mut inner = Tree::new();
        inner.push(TreeEntry::blob("body", Blob::utf8("hello")));

        let mut root = Tree::new();
        root.push(TreeEntry::blob(".attributes", Blob::utf8("{}")));
        root.push(TreeEntry::blob("payload", Blob::binary(&[0, 159, 146, 150])));
        root.push(TreeEntry::tree("content", inner));
        root.push(TreeEntry::commit("text", "abc123"));
        root
    }

    #[test]
    fn test_content_hash_is_stable_hex() {
        let a = content_hash(b"quill");
        let b = content_hash(b"quill");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash(b"quill!"));
    }

    #[test]
    fn test_binary_blob_decodes() {
        let blob = Blob::binary(&[0, 159, 146, 150]);
        assert_eq!(blob.encoding, Encoding::Base64);
        assert_eq!(blob.to_bytes().unwrap(), vec![0, 159, 146, 150]);
    }

    #[test]
    fn test_invalid_base64_errors() {
        let blob = Blob {
            contents: "!!not base64!!".to_string(),
            encoding: Encoding::Base64,
        };
        assert!(blob.to_bytes().is_err());
    }

    #[test]
    fn test_to_snapshot_tree_records_blobs() {
        let tree = sample_tree();
        let mut blobs = HashMap::new();
        let snapshot = tree.to_snapshot_tree(&mut blobs).unwrap();

        let attributes_sha = snapshot.blob(".attributes").unwrap();
        assert_eq!(blobs[attributes_sha], b"{}".to_vec());

        let payload_sha = snapshot.blob("payload").unwrap();
        assert_eq!(blobs[payload_sha], vec![0, 159, 146, 150]);

        let body_sha = snapshot.trees["content"].blob("body").unwrap();
        assert_eq!(blobs[body_sha], b"hello".to_vec());

        assert_eq!(snapshot.commits["text"], "abc123");
        assert_eq!(blobs.len(), 3);
    }

    #[test]
    fn test_tree_json_shape() {
        let tree = sample_tree();
        let value = serde_json::to_value(&tree).unwrap();
        let first = &value["entries"][0];

        assert_eq!(first["path"], ".attributes");
        assert_eq!(first["mode"], "100644");
        assert_eq!(first["type"], "blob");
        assert_eq!(first["value"]["encoding"], "utf-8");
        assert_eq!(value["entries"][3]["type"], "commit");
        assert_eq!(value["entries"][3]["value"], "abc123");

        let back: Tree = serde_json::from_value(value).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_tree_lookup() {
        let tree = sample_tree();
        assert!(tree.blob(".attributes").is_some());
        assert!(tree.blob("content").is_none());
        assert!(tree.entry("missing").is_none());
    }
}
