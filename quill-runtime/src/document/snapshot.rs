//! Writing snapshots.
//!
//! Root tree layout:
//!
//! | entry          | contents                                            |
//! |----------------|-----------------------------------------------------|
//! | `.messages`    | ops above the MSN, transformed to the current seq   |
//! | `.blobs`       | attachment metadata                                 |
//! | `quorum`       | members, pending proposals, agreed values           |
//! | `.attributes`  | branch, seq, MSN, partial chunked ops, quorum state |
//! | `deltas`       | ops since the previous snapshot                     |
//! | `<address>`    | commit of the channel's own tree                    |
//! | `.gitmodules`  | one `[submodule]` section per channel               |

use futures_util::future::try_join_all;
use quill_core::{
    Blob, DocumentAttributes, MessageContents, SequencedMessage, Tree, TreeEntry, Version,
};

use super::Document;
use crate::error::DocumentError;

pub(crate) const MESSAGES_BLOB: &str = ".messages";
pub(crate) const BLOBS_BLOB: &str = ".blobs";
pub(crate) const QUORUM_BLOB: &str = "quorum";
pub(crate) const ATTRIBUTES_BLOB: &str = ".attributes";
pub(crate) const DELTAS_BLOB: &str = "deltas";
pub(crate) const GITMODULES_BLOB: &str = ".gitmodules";

/// Abbreviated sha for logs. Storage services may hand back short ids.
fn short_sha(sha: &str) -> &str {
    sha.get(..12).unwrap_or(sha)
}

impl Document {
    /// Write a snapshot tagged `tag`.
    ///
    /// Forked documents are never snapshotted and yield `None`.
    pub async fn snapshot(&mut self, tag: &str) -> Result<Option<Version>, DocumentError> {
        self.ensure_open()?;
        if self.parent_branch.is_some() {
            log::info!("{}: not snapshotting a branch of {:?}", self.id, self.parent_branch);
            return Ok(None);
        }

        let sequence_number = self.delta_manager.reference_sequence_number();
        let message = format!("Commit @{sequence_number} {tag}");
        let mut root = self.snapshot_base()?;

        // Ops since the last snapshot
        let last_sequence_number = match &self.last_version {
            Some(sha) => self.last_snapshot_sequence_number(sha).await?,
            None => 0,
        };
        let deltas = self
            .delta_manager
            .get_deltas(last_sequence_number, Some(sequence_number + 1))
            .await?;
        root.push(TreeEntry::blob(DELTAS_BLOB, Blob::json(&deltas)?));

        // One commit per channel
        let storage = self.storage.clone();
        let mut channel_trees = Vec::with_capacity(self.components.len());
        for (address, component) in &self.components {
            channel_trees.push((address.clone(), component.snapshot()?));
        }
        let commits = try_join_all(channel_trees.iter().map(|(address, tree)| {
            let storage = storage.clone();
            let reference = format!("{}/{}", self.id, address);
            let message = message.clone();
            async move {
                let parents: Vec<String> = storage
                    .get_versions(&reference, 1)
                    .await?
                    .into_iter()
                    .map(|v| v.sha)
                    .collect();
                let version = storage.write(tree, &parents, &message, &reference).await?;
                Ok::<_, DocumentError>((address.clone(), version.sha))
            }
        }))
        .await?;

        let mut gitmodules = String::new();
        for (address, sha) in commits {
            gitmodules.push_str(&format!(
                "[submodule \"{address}\"]\n\tpath = {address}\n\turl = {}\n\n",
                storage.repository_url()
            ));
            root.push(TreeEntry::commit(address, sha));
        }
        root.push(TreeEntry::blob(GITMODULES_BLOB, Blob::utf8(gitmodules)));

        let parents: Vec<String> = self.last_version.iter().cloned().collect();
        let version = storage.write(&root, &parents, &message, "").await?;
        log::info!(
            "{}: snapshot {} at seq {} ({} channels)",
            self.id,
            short_sha(&version.sha),
            sequence_number,
            self.components.len()
        );
        self.last_version = Some(version.sha.clone());
        Ok(Some(version))
    }

    /// Document-level entries of the root tree.
    pub(crate) fn snapshot_base(&self) -> Result<Tree, DocumentError> {
        let sequence_number = self.delta_manager.reference_sequence_number();
        let minimum_sequence_number = self.delta_manager.minimum_sequence_number();

        let expected = sequence_number.saturating_sub(minimum_sequence_number);
        if self.messages_since_msn_change.len() as u64 != expected {
            log::warn!(
                "{}: {} ops above MSN but seq - msn = {}",
                self.id,
                self.messages_since_msn_change.len(),
                expected
            );
        }

        let transformed: Vec<SequencedMessage> = self
            .messages_since_msn_change
            .iter()
            .map(|message| self.transform(message.clone(), sequence_number))
            .collect();

        let quorum = self.quorum.snapshot();
        let attributes = DocumentAttributes {
            branch: self.id.clone(),
            sequence_number,
            minimum_sequence_number,
            clients: quorum.members.clone(),
            partial_ops: self.chunks.partial_ops(),
            proposals: quorum.proposals.clone(),
            values: quorum.values.clone(),
        };

        let mut tree = Tree::new();
        tree.push(TreeEntry::blob(MESSAGES_BLOB, Blob::json(&transformed)?));
        tree.push(TreeEntry::blob(
            BLOBS_BLOB,
            Blob::json(&self.blob_manager.get_blob_metadata())?,
        ));
        tree.push(TreeEntry::blob(QUORUM_BLOB, Blob::json(&quorum)?));
        tree.push(TreeEntry::blob(ATTRIBUTES_BLOB, Blob::json(&attributes)?));
        Ok(tree)
    }

    /// Rewrite `message` so it applies against state at `sequence_number`.
    /// Channel ops go to their channel; everything else becomes a `noOp`.
    pub(crate) fn transform(
        &self,
        mut message: SequencedMessage,
        sequence_number: u64,
    ) -> SequencedMessage {
        match message.contents.address().map(str::to_string) {
            Some(address) => {
                if let Some(component) = self.components.get(&address) {
                    component.transform(&mut message, sequence_number);
                }
            }
            None => message.contents = MessageContents::NoOp,
        }
        message.reference_sequence_number = sequence_number;
        message
    }

    async fn last_snapshot_sequence_number(&self, sha: &str) -> Result<u64, DocumentError> {
        let Some(version) = self.storage.get_versions(sha, 1).await?.into_iter().next() else {
            return Ok(0);
        };
        let tree = self.storage.get_snapshot_tree(&version).await?;
        let Some(attributes_sha) = tree.blob(ATTRIBUTES_BLOB) else {
            return Ok(0);
        };
        let attributes: DocumentAttributes =
            crate::storage::read_and_parse(self.storage.as_ref(), attributes_sha).await?;
        Ok(attributes.sequence_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_sha_abbreviates_long_hashes() {
        let sha = quill_core::content_hash(b"snapshot");
        assert_eq!(short_sha(&sha), &sha[..12]);
    }

    #[test]
    fn test_short_sha_keeps_short_ids() {
        assert_eq!(short_sha("v1"), "v1");
        assert_eq!(short_sha(""), "");
    }
}
