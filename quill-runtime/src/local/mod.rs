//! In-process service: ordering, delta storage and snapshot storage without
//! a network. Useful for tests, demos and single-process embedding.

pub mod orderer;
pub mod service;

pub use orderer::{LocalConnection, LocalOrderer, OrdererStats};
pub use service::{LocalDeltaStorage, LocalDocumentService, LocalServiceConfig};
