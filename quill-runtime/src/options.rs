//! Document runtime configuration.
//!
//! Options are plain data: construct with [`DocumentOptions::default`],
//! override fields, or parse a JSON object where every field is optional.

use std::time::Duration;

use quill_core::ClientDetail;
use serde::{Deserialize, Serialize};

/// Package loaded when a snapshot has channels but its quorum never agreed on
/// a `code` value.
pub const DEFAULT_LEGACY_PACKAGE: &str = "@quill/legacy";

/// Options for loading and running a [`Document`](crate::Document).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DocumentOptions {
    /// Client detail announced to the ordering service
    pub client: ClientDetail,
    /// Transport limit used when the connection does not advertise one
    pub default_max_message_size: usize,
    /// Send a `noOp` after this many processed ops without a local submit.
    /// `None` disables keep-alive ops.
    pub noop_frequency: Option<u64>,
    /// Package used for snapshots without a `code` quorum value
    pub legacy_code_package: String,
    /// Reconnect automatically after a disconnect or nack
    pub reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            client: ClientDetail::default(),
            default_max_message_size: 16 * 1024,
            noop_frequency: Some(50),
            legacy_code_package: DEFAULT_LEGACY_PACKAGE.to_string(),
            reconnect: true,
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl DocumentOptions {
    /// Options for tests: keep-alive after every op and immediate reconnects.
    pub fn for_testing() -> Self {
        Self {
            noop_frequency: Some(1),
            reconnect_delay_ms: 0,
            max_reconnect_attempts: 2,
            ..Default::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = DocumentOptions::default();
        assert_eq!(options.default_max_message_size, 16 * 1024);
        assert_eq!(options.noop_frequency, Some(50));
        assert_eq!(options.legacy_code_package, DEFAULT_LEGACY_PACKAGE);
        assert!(options.reconnect);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options =
            DocumentOptions::from_json(r#"{"noopFrequency": null, "reconnectDelayMs": 25}"#)
                .unwrap();
        assert_eq!(options.noop_frequency, None);
        assert_eq!(options.reconnect_delay(), Duration::from_millis(25));
        assert_eq!(options.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_for_testing_sends_noop_every_op() {
        let options = DocumentOptions::for_testing();
        assert_eq!(options.noop_frequency, Some(1));
        assert_eq!(options.reconnect_delay(), Duration::ZERO);
    }
}
