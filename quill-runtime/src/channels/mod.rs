//! Built-in channel types.
//!
//! - [`map`]: last-writer-wins key/value map
//! - [`text`]: collaborative text backed by a Yrs document

pub mod map;
pub mod text;

use std::sync::Arc;

pub use map::{MapChannel, MapFactory, MapOp, MAP_TYPE};
pub use text::{TextChannel, TextFactory, TextOp, TEXT_TYPE};

use crate::code::Chaincode;

/// Chaincode offering every built-in channel type under `package`.
pub fn standard_chaincode(package: impl Into<String>) -> Chaincode {
    Chaincode::new(package)
        .with_factory(Arc::new(MapFactory))
        .with_factory(Arc::new(TextFactory))
}
