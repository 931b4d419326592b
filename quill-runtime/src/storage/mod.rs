//! Snapshot storage.
//!
//! - [`service`]: the storage contract and helpers over it
//! - [`memory`]: in-memory, content-addressed, LZ4-compressed store
//! - [`runtime`]: overlay that serves in-flight blobs before hitting storage

pub mod memory;
pub mod runtime;
pub mod service;

pub use memory::{MemoryStorage, StorageStats};
pub use runtime::RuntimeStorageService;
pub use service::{read_and_parse, CreateBlobResponse, DocumentStorageService, StorageError};
