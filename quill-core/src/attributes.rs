//! Persisted document header and quorum snapshot.
//!
//! Both are written as JSON blobs (`.attributes` and `quorum`) on every
//! snapshot and read back at load time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::message::{ClientDetail, ClientId};

/// A proposal as it was sequenced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedProposal {
    pub sequence_number: u64,
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub client_sequence_number: u64,
    /// Proposing client, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
}

/// Persisted form of a pending proposal:
/// `(sequenceNumber, proposal, acceptedClientIds)`.
pub type PendingProposal = (u64, SequencedProposal, Vec<ClientId>);

/// Serialized quorum state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuorumSnapshot {
    #[serde(default)]
    pub members: Vec<(ClientId, ClientDetail)>,
    #[serde(default)]
    pub proposals: Vec<PendingProposal>,
    #[serde(default)]
    pub values: Vec<(String, Value)>,
}

/// The `.attributes` header of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAttributes {
    /// Branch the snapshot belongs to; differs from the document id for forks
    pub branch: String,
    /// Last applied sequence number
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    #[serde(default)]
    pub clients: Vec<(ClientId, ClientDetail)>,
    /// Reassembly buffers of in-flight chunked ops, per sending client
    #[serde(default)]
    pub partial_ops: Vec<(ClientId, Vec<String>)>,
    #[serde(default)]
    pub proposals: Vec<PendingProposal>,
    #[serde(default)]
    pub values: Vec<(String, Value)>,
}

impl DocumentAttributes {
    /// Header for a document that has never been snapshotted.
    pub fn new_document(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            sequence_number: 0,
            minimum_sequence_number: 0,
            clients: Vec::new(),
            partial_ops: Vec::new(),
            proposals: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), AttributesError> {
        if self.sequence_number < self.minimum_sequence_number {
            return Err(AttributesError::MsnAheadOfSequence {
                sequence_number: self.sequence_number,
                minimum_sequence_number: self.minimum_sequence_number,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttributesError {
    #[error("minimum sequence number {minimum_sequence_number} is ahead of sequence number {sequence_number}")]
    MsnAheadOfSequence {
        sequence_number: u64,
        minimum_sequence_number: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_document_defaults() {
        let attrs = DocumentAttributes::new_document("doc-1");
        assert_eq!(attrs.branch, "doc-1");
        assert_eq!(attrs.sequence_number, 0);
        assert_eq!(attrs.minimum_sequence_number, 0);
        assert!(attrs.clients.is_empty());
        assert!(attrs.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_msn_ahead() {
        let mut attrs = DocumentAttributes::new_document("doc-1");
        attrs.sequence_number = 3;
        attrs.minimum_sequence_number = 5;
        let err = attrs.validate().unwrap_err();
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn test_attributes_parse_with_missing_collections() {
        let raw = r#"{"branch":"b","sequenceNumber":9,"minimumSequenceNumber":7}"#;
        let attrs: DocumentAttributes = serde_json::from_str(raw).unwrap();
        assert_eq!(attrs.sequence_number, 9);
        assert!(attrs.partial_ops.is_empty());
        assert!(attrs.values.is_empty());
    }

    #[test]
    fn test_quorum_snapshot_tuple_layout() {
        let snapshot = QuorumSnapshot {
            members: vec![("c1".to_string(), ClientDetail::default())],
            proposals: vec![(
                12,
                SequencedProposal {
                    sequence_number: 12,
                    key: "code".to_string(),
                    value: json!("pkg"),
                    client_sequence_number: 2,
                    client_id: Some("c1".to_string()),
                },
                vec!["c1".to_string()],
            )],
            values: vec![("code".to_string(), json!("old"))],
        };
        let value = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(value["members"][0][0], "c1");
        assert_eq!(value["proposals"][0][0], 12);
        assert_eq!(value["proposals"][0][1]["key"], "code");
        assert_eq!(value["proposals"][0][2][0], "c1");
        assert_eq!(value["values"][0][1], "old");
    }
}
