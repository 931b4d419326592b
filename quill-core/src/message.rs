//! Sequenced operation log entries.
//!
//! Wire format (JSON, camelCase):
//! ```text
//! {
//!   "sequenceNumber": 42,            // server assigned, gapless
//!   "minimumSequenceNumber": 40,     // MSN as of this op
//!   "clientId": "c1",                // null for system messages
//!   "clientSequenceNumber": 7,       // per-client counter
//!   "referenceSequenceNumber": 41,   // last op the sender had seen
//!   "type": "operation",
//!   "contents": { "address": "root", "contents": { … } }
//! }
//! ```
//!
//! `type` + `contents` form the closed [`MessageContents`] sum type, so every
//! consumer matches exhaustively over the message kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tree::Tree;

/// Identifier assigned to a connected client by the ordering service.
pub type ClientId = String;

/// Tag naming the kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// Channel operation routed by address
    Operation,
    /// Quorum proposal for a key/value setting
    Propose,
    /// Rejection of a pending proposal
    Reject,
    /// A client joined the session
    ClientJoin,
    /// A client left the session
    ClientLeave,
    /// Fragment of an oversized message
    ChunkedOp,
    /// A binary attachment was uploaded
    BlobUploaded,
    /// Keep-alive carrying the sender's reference sequence number
    NoOp,
    /// A new channel was attached to the document
    Attach,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operation => "operation",
            Self::Propose => "propose",
            Self::Reject => "reject",
            Self::ClientJoin => "clientJoin",
            Self::ClientLeave => "clientLeave",
            Self::ChunkedOp => "chunkedOp",
            Self::BlobUploaded => "blobUploaded",
            Self::NoOp => "noOp",
            Self::Attach => "attach",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User identity attached to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }
}

/// Client metadata tracked in quorum membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    /// Free-form client kind ("browser", "agent", …)
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ClientDetail {
    pub fn for_user(user: User) -> Self {
        Self {
            user: Some(user),
            kind: None,
        }
    }
}

/// Payload of a `clientJoin` system message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientJoin {
    pub client_id: ClientId,
    pub detail: ClientDetail,
}

/// Channel operation addressed to one sub-component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub address: String,
    pub contents: Value,
}

/// Proposal for an agreed key/value setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub key: String,
    pub value: Value,
}

/// One fragment of an oversized message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedOp {
    /// 1-based ordinal of this chunk
    pub chunk_id: u32,
    pub total_chunks: u32,
    /// Slice of the serialized original contents
    pub contents: String,
    pub original_type: MessageType,
}

/// Metadata for a content-addressed binary attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    pub sha: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl BlobMetadata {
    pub fn new(sha: impl Into<String>, size: u64) -> Self {
        Self {
            sha: sha.into(),
            size,
            file_name: None,
            content_type: None,
            encoding: None,
            url: None,
        }
    }
}

/// Payload of an `attach` message: a new channel and its initial state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachMessage {
    /// Address of the new channel
    pub id: String,
    /// Channel type, resolved through the active chaincode
    #[serde(rename = "type")]
    pub kind: String,
    pub snapshot: Tree,
}

/// Branch origin stamped on messages replayed from a parent branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub id: String,
    pub minimum_sequence_number: u64,
    pub sequence_number: u64,
}

/// Typed message contents, keyed on the wire by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "contents", rename_all = "camelCase")]
pub enum MessageContents {
    Operation(Envelope),
    Propose(Proposal),
    /// Sequence number of the rejected proposal
    Reject(u64),
    ClientJoin(ClientJoin),
    /// Id of the departing client
    ClientLeave(ClientId),
    ChunkedOp(ChunkedOp),
    BlobUploaded(BlobMetadata),
    NoOp,
    Attach(AttachMessage),
}

impl MessageContents {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Operation(_) => MessageType::Operation,
            Self::Propose(_) => MessageType::Propose,
            Self::Reject(_) => MessageType::Reject,
            Self::ClientJoin(_) => MessageType::ClientJoin,
            Self::ClientLeave(_) => MessageType::ClientLeave,
            Self::ChunkedOp(_) => MessageType::ChunkedOp,
            Self::BlobUploaded(_) => MessageType::BlobUploaded,
            Self::NoOp => MessageType::NoOp,
            Self::Attach(_) => MessageType::Attach,
        }
    }

    /// Convenience constructor for a channel operation.
    pub fn operation(address: impl Into<String>, contents: Value) -> Self {
        Self::Operation(Envelope {
            address: address.into(),
            contents,
        })
    }

    /// Channel address for `operation` messages.
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Operation(envelope) => Some(&envelope.address),
            _ => None,
        }
    }

    /// The `contents` half of the wire shape, without the `type` tag.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .as_object_mut()
            .and_then(|obj| obj.remove("contents"))
            .unwrap_or(Value::Null))
    }

    /// Serialized payload, the unit measured against the transport limit.
    pub fn serialized_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.payload()?)
    }

    /// Rebuild typed contents from a tag and its JSON payload.
    pub fn from_payload(kind: MessageType, payload: Value) -> Result<Self, serde_json::Error> {
        if kind == MessageType::NoOp {
            return Ok(Self::NoOp);
        }
        serde_json::from_value(serde_json::json!({
            "type": kind,
            "contents": payload,
        }))
    }
}

/// A message after the ordering service has stamped it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    /// Sender; `None` for service-generated system messages
    #[serde(default)]
    pub client_id: Option<ClientId>,
    #[serde(default)]
    pub client_sequence_number: u64,
    #[serde(default)]
    pub reference_sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    /// Milliseconds since the epoch at sequencing time
    #[serde(default)]
    pub timestamp: u64,
    #[serde(flatten)]
    pub contents: MessageContents,
}

impl SequencedMessage {
    pub fn kind(&self) -> MessageType {
        self.contents.kind()
    }

    /// Whether `client_id` sent this message.
    pub fn is_from(&self, client_id: &str) -> bool {
        self.client_id.as_deref() == Some(client_id)
    }
}

/// An outbound message before sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMessage {
    pub client_sequence_number: u64,
    pub reference_sequence_number: u64,
    #[serde(flatten)]
    pub contents: MessageContents,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sequenced(contents: MessageContents) -> SequencedMessage {
        SequencedMessage {
            sequence_number: 10,
            minimum_sequence_number: 4,
            client_id: Some("c1".to_string()),
            client_sequence_number: 3,
            reference_sequence_number: 9,
            origin: None,
            timestamp: 0,
            contents,
        }
    }

    #[test]
    fn test_operation_wire_shape() {
        let msg = sequenced(MessageContents::operation("root", json!({"set": 1})));
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["type"], "operation");
        assert_eq!(value["sequenceNumber"], 10);
        assert_eq!(value["minimumSequenceNumber"], 4);
        assert_eq!(value["contents"]["address"], "root");
        assert_eq!(value["contents"]["contents"]["set"], 1);
    }

    #[test]
    fn test_sequenced_message_parses_from_json() {
        let raw = r#"{
            "sequenceNumber": 5,
            "minimumSequenceNumber": 2,
            "clientId": null,
            "clientSequenceNumber": 0,
            "referenceSequenceNumber": 4,
            "type": "clientJoin",
            "contents": { "clientId": "c9", "detail": { "type": "browser" } }
        }"#;
        let msg: SequencedMessage = serde_json::from_str(raw).unwrap();

        assert_eq!(msg.kind(), MessageType::ClientJoin);
        assert!(msg.client_id.is_none());
        match msg.contents {
            MessageContents::ClientJoin(join) => {
                assert_eq!(join.client_id, "c9");
                assert_eq!(join.detail.kind.as_deref(), Some("browser"));
            }
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn test_noop_has_no_contents() {
        let msg = sequenced(MessageContents::NoOp);
        let text = serde_json::to_string(&msg).unwrap();
        let back: SequencedMessage = serde_json::from_str(&text).unwrap();

        assert_eq!(back.contents, MessageContents::NoOp);
        assert_eq!(MessageContents::NoOp.payload().unwrap(), Value::Null);
    }

    #[test]
    fn test_payload_and_from_payload_restore_contents() {
        let original = MessageContents::Propose(Proposal {
            key: "code".to_string(),
            value: json!("pkgB"),
        });
        let payload = original.payload().unwrap();
        assert_eq!(payload["key"], "code");

        let rebuilt = MessageContents::from_payload(MessageType::Propose, payload).unwrap();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_reject_payload_is_sequence_number() {
        let reject = MessageContents::Reject(17);
        assert_eq!(reject.serialized_payload().unwrap(), "17");
        assert_eq!(
            MessageContents::from_payload(MessageType::Reject, json!(17)).unwrap(),
            reject
        );
    }

    #[test]
    fn test_from_payload_rejects_mismatched_shape() {
        let result = MessageContents::from_payload(MessageType::ClientJoin, json!(42));
        assert!(result.is_err());
    }

    #[test]
    fn test_is_from() {
        let msg = sequenced(MessageContents::NoOp);
        assert!(msg.is_from("c1"));
        assert!(!msg.is_from("c2"));
    }

    #[test]
    fn test_message_type_names_match_wire_tags() {
        for kind in [
            MessageType::Operation,
            MessageType::Propose,
            MessageType::Reject,
            MessageType::ClientJoin,
            MessageType::ClientLeave,
            MessageType::ChunkedOp,
            MessageType::BlobUploaded,
            MessageType::NoOp,
            MessageType::Attach,
        ] {
            let tag = serde_json::to_value(kind).unwrap();
            assert_eq!(tag, Value::String(kind.to_string()));
        }
    }

    #[test]
    fn test_document_message_flattens_contents() {
        let msg = DocumentMessage {
            client_sequence_number: 1,
            reference_sequence_number: 0,
            contents: MessageContents::ChunkedOp(ChunkedOp {
                chunk_id: 1,
                total_chunks: 2,
                contents: "{\"a\"".to_string(),
                original_type: MessageType::Operation,
            }),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "chunkedOp");
        assert_eq!(value["contents"]["totalChunks"], 2);
        assert_eq!(value["contents"]["originalType"], "operation");
    }
}
