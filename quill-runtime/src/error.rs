//! Top-level error type for document operations.
//!
//! Each subsystem owns its error enum; [`DocumentError`] wraps them so the
//! document API propagates everything with `?`.

use quill_core::{AttributesError, TreeError};
use thiserror::Error;

use crate::code::{ChannelError, CodeError};
use crate::delta::DeltaError;
use crate::handle::RuntimeClosed;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error(transparent)]
    Code(#[from] CodeError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("invalid document attributes: {0}")]
    Attributes(#[from] AttributesError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    RuntimeClosed(#[from] RuntimeClosed),

    #[error("snapshot is missing blob {0}")]
    MissingBlob(String),

    #[error("no channel at address {0}")]
    UnknownChannel(String),

    #[error("channel {0} already exists")]
    ChannelExists(String),

    #[error("document {0} is not connected")]
    NotConnected(String),

    #[error("document {0} is closed")]
    Closed(String),
}
