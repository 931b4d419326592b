//! # quill-runtime: Client runtime for Quill collaborative documents
//!
//! A [`Document`] is a local replica of a document whose history is a
//! totally ordered op log kept by an ordering service. The runtime loads the
//! latest snapshot, replays the ops sequenced since, applies new ops in
//! order, submits local ops and periodically writes snapshots back.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ops   ┌──────────────┐ inbound ┌──────────────────────┐
//! │ Ordering     │ ─────► │ DeltaManager │ ──────► │ Document             │
//! │ service      │ ◄───── │ (gaps, csn,  │ ◄────── │  ├─ Quorum           │
//! └──────────────┘ submit │  reconnect)  │ outbound│  ├─ BlobManager      │
//!                         └──────────────┘         │  └─ Components       │
//! ┌──────────────┐           snapshot / load       │      (map, text, …)  │
//! │ Storage      │ ◄─────────────────────────────► │                      │
//! └──────────────┘                                 └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: the orchestrator: load, process, submit, snapshot
//! - [`delta`]: op stream ordering, gap repair, reconnects
//! - [`quorum`]: membership and MSN-based proposal approval
//! - [`chunk`]: splitting and reassembly of oversized ops
//! - [`blob`]: binary attachment metadata
//! - [`code`]: channel contracts, chaincode and code loading
//! - [`channels`]: the standard `map` and `text` channels
//! - [`storage`]: snapshot storage contract and in-memory store
//! - [`service`]: service entry point and token providers
//! - [`local`]: in-process ordering service
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Split + reassemble 64KB op | <200μs |
//! | Quorum MSN update, 100 pending proposals | <20μs |
//! | Snapshot write, 1K map keys (memory) | <5ms |
//! | Memory per idle document | <1MB |

pub mod blob;
pub mod channels;
pub mod chunk;
pub mod code;
pub mod delta;
pub mod document;
pub mod error;
pub mod events;
pub mod handle;
pub mod local;
pub mod options;
pub mod quorum;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use blob::BlobManager;
pub use channels::{standard_chaincode, MapChannel, TextChannel, MAP_TYPE, TEXT_TYPE};
pub use chunk::{split_into_chunks, ChunkReassembler, UnackedChunks};
pub use code::{
    load_code, Chaincode, Channel, ChannelError, ChannelFactory, ChannelServices, CodeError,
    CodeLoader, CodeModule, PrebuiltModule, StaticCodeLoader,
};
pub use delta::{DeltaError, DeltaEvent, DeltaManager};
pub use document::{Component, ConnectionState, Document, LoadRequest, CODE_KEY};
pub use error::DocumentError;
pub use events::{DocumentEvent, ListenerId, Listeners, QuorumEvent};
pub use handle::{RuntimeClosed, RuntimeHandle, RuntimeRequest};
pub use local::{LocalDocumentService, LocalOrderer, LocalServiceConfig};
pub use options::DocumentOptions;
pub use quorum::{ApprovedProposal, Quorum};
pub use service::{DocumentService, StaticTokenProvider, TokenProvider};
pub use storage::{DocumentStorageService, MemoryStorage, StorageError};

pub use quill_core;
