//! Transport contracts.

use async_trait::async_trait;
use quill_core::{ClientId, DocumentMessage, SequencedMessage};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("delta storage error: {0}")]
    Storage(String),

    #[error("unable to reconnect after {0} attempts")]
    ReconnectExhausted(u32),
}

/// Handshake result of a delta stream connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDetails {
    pub client_id: ClientId,
    /// Whether the document already existed on the service
    pub existing: bool,
    pub parent_branch: Option<String>,
    /// Largest serialized payload the transport accepts, in bytes
    pub max_message_size: usize,
    /// Ops the service chose to deliver with the handshake
    pub initial_messages: Vec<SequencedMessage>,
}

/// Events pushed by a live connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Ops(Vec<SequencedMessage>),
    /// The service refused a submission and dropped the client
    Nack(String),
    Disconnect(String),
    /// Round trip latency in milliseconds
    Pong(u64),
}

/// A live, bidirectional delta stream.
pub trait DeltaConnection: Send {
    fn details(&self) -> &ConnectionDetails;

    fn submit(&mut self, messages: Vec<DocumentMessage>) -> Result<(), DeltaError>;

    /// Take the event receiver (can only be called once).
    fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;

    fn close(&mut self);
}

/// Historical op log.
#[async_trait]
pub trait DeltaStorageService: Send + Sync {
    /// Ops with `from < sequenceNumber < to`, in order. `to = None` reads to
    /// the end of the log.
    async fn get(&self, from: u64, to: Option<u64>) -> Result<Vec<SequencedMessage>, DeltaError>;
}
