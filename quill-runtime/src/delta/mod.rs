//! Delta stream handling.
//!
//! - [`connection`]: transport contracts and connection events
//! - [`queue`]: pausable FIFO used for inbound and outbound traffic
//! - [`manager`]: ordering, gap repair, client sequence numbers, reconnects

pub mod connection;
pub mod manager;
pub mod queue;

pub use connection::{
    ConnectionDetails, ConnectionEvent, DeltaConnection, DeltaError, DeltaStorageService,
};
pub use manager::{DeltaEvent, DeltaManager};
pub use queue::DeltaQueue;
