//! # quill-core: Shared data model for Quill collaborative documents
//!
//! Everything that crosses a process boundary lives here: the sequenced
//! operation log entries, the snapshot tree layout written to storage and the
//! persisted document header.
//!
//! ## Wire shape
//!
//! ```text
//! ┌──────────────────────── SequencedMessage ────────────────────────┐
//! │ sequenceNumber │ minimumSequenceNumber │ clientId │ clientSeq …  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ type: operation | propose | reject | clientJoin | clientLeave   │
//! │       chunkedOp | blobUploaded | noOp | attach                  │
//! │ contents: payload selected by `type`                            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`message`]: sequenced / outbound messages and typed contents
//! - [`tree`]: snapshot trees, versions and content addressing
//! - [`attributes`]: persisted document header and quorum snapshot

pub mod attributes;
pub mod message;
pub mod tree;

pub use attributes::{
    AttributesError, DocumentAttributes, PendingProposal, QuorumSnapshot, SequencedProposal,
};
pub use message::{
    AttachMessage, BlobMetadata, ChunkedOp, ClientDetail, ClientId, ClientJoin, DocumentMessage,
    Envelope, MessageContents, MessageType, Origin, Proposal, SequencedMessage, User,
};
pub use tree::{
    content_hash, Blob, Encoding, FileMode, SnapshotTree, Tree, TreeEntry, TreeError, TreeValue,
    Version,
};
