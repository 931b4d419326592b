//! Connection state machine and outbound submission.
//!
//! ```text
//! Disconnected ──handshake──► Connecting ──own clientJoin sequenced──► Connected
//!      ▲                                                                   │
//!      └───────────────────────── disconnect / nack ───────────────────────┘
//! ```
//!
//! Submissions are only accepted while `Connected`. Payloads over the
//! transport limit go out as a run of `chunkedOp` messages and are kept
//! until their final chunk is sequenced, so a reconnect can resend them.

use quill_core::{MessageContents, MessageType};

use super::Document;
use crate::chunk::{split_into_chunks, BufferedChunk};
use crate::error::DocumentError;
use crate::events::DocumentEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Handshake done, our join not yet sequenced
    Connecting,
    Connected,
}

impl Document {
    /// Move to `value`. Repeating the current state is a no-op.
    pub(crate) fn set_connection_state(
        &mut self,
        value: ConnectionState,
        reason: &str,
        client_id: Option<String>,
    ) {
        if self.connection_state == value {
            return;
        }
        log::debug!(
            "{}: {:?} -> {:?} ({})",
            self.id,
            self.connection_state,
            value,
            reason
        );
        self.connection_state = value;

        match value {
            ConnectionState::Connecting => self.pending_client_id = client_id,
            ConnectionState::Connected => {
                self.delta_manager.disable_readonly_mode();
                self.client_id = self.pending_client_id.clone();
            }
            ConnectionState::Disconnected => {}
        }

        if !self.loaded {
            return;
        }

        let client_id = self.client_id.clone();
        for component in self.components.values_mut() {
            component.change_connection_state(value, client_id.as_deref());
        }

        if value == ConnectionState::Connected {
            if let Some(client_id) = client_id {
                log::info!("{}: connected as {}", self.id, client_id);
                self.emit(DocumentEvent::Connected(client_id));
            }
        }
    }

    /// Submit `contents` as the local client.
    ///
    /// Returns the client sequence number, or `None` when not connected.
    /// Chunked messages report the sequence number of their final chunk.
    pub(crate) fn submit_message(
        &mut self,
        contents: MessageContents,
    ) -> Result<Option<u64>, DocumentError> {
        if self.connection_state != ConnectionState::Connected {
            log::debug!(
                "{}: dropping {} submitted while {:?}",
                self.id,
                contents.kind(),
                self.connection_state
            );
            return Ok(None);
        }

        let serialized = contents.serialized_payload()?;
        let max_size = self.delta_manager.max_message_size();
        if serialized.len() <= max_size {
            return Ok(Some(self.delta_manager.submit(contents)?));
        }

        let original_type = contents.kind();
        let final_csn = self.submit_chunked_message(original_type, &serialized)?;
        self.unacked_chunks.insert(
            final_csn,
            BufferedChunk {
                original_type,
                content: serialized,
            },
        );
        Ok(Some(final_csn))
    }

    fn submit_chunked_message(
        &mut self,
        original_type: MessageType,
        serialized: &str,
    ) -> Result<u64, DocumentError> {
        let chunks = split_into_chunks(
            original_type,
            serialized,
            self.delta_manager.max_message_size(),
        );
        log::debug!(
            "{}: sending {} ({} bytes) as {} chunks",
            self.id,
            original_type,
            serialized.len(),
            chunks.len()
        );
        let mut final_csn = 0;
        for chunk in chunks {
            final_csn = self.delta_manager.submit(MessageContents::ChunkedOp(chunk))?;
        }
        Ok(final_csn)
    }

    /// Resend every unacknowledged oversized message on the new connection,
    /// in original submission order.
    pub(crate) fn send_unacked_chunks(&mut self) -> Result<(), DocumentError> {
        let pending = self.unacked_chunks.drain();
        if !pending.is_empty() {
            log::info!(
                "{}: resending {} unacknowledged chunked messages",
                self.id,
                pending.len()
            );
        }
        for chunk in pending {
            let final_csn = self.submit_chunked_message(chunk.original_type, &chunk.content)?;
            self.unacked_chunks.insert(final_csn, chunk);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::MAP_TYPE;
    use crate::code::StaticCodeLoader;
    use crate::document::LoadRequest;
    use crate::local::{LocalDocumentService, LocalServiceConfig};
    use crate::options::DocumentOptions;
    use quill_core::User;
    use std::sync::Arc;

    async fn offline_document() -> Document {
        let service = Arc::new(LocalDocumentService::new(LocalServiceConfig::for_testing()));
        let request = LoadRequest::new(
            "doc",
            "tenant",
            User::new("alice"),
            service,
            Arc::new(StaticCodeLoader::new()),
        )
        .with_options(DocumentOptions::for_testing())
        .without_connection();
        Document::load(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_repeated_state_is_a_no_op() {
        let mut doc = offline_document().await;
        let mut events = doc.subscribe();
        assert_eq!(doc.connection_state(), ConnectionState::Disconnected);

        doc.set_connection_state(ConnectionState::Connecting, "handshake", Some("c1".into()));
        doc.set_connection_state(ConnectionState::Connecting, "handshake", Some("c2".into()));
        assert_eq!(doc.pending_client_id.as_deref(), Some("c1"));

        doc.set_connection_state(ConnectionState::Connected, "joined", None);
        doc.set_connection_state(ConnectionState::Connected, "joined", None);
        assert_eq!(doc.client_id(), Some("c1"));
        assert_eq!(doc.pending_client_id.as_deref(), Some("c1"));

        let mut connected = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DocumentEvent::Connected(id) = event {
                connected.push(id);
            }
        }
        assert_eq!(connected, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_submit_while_disconnected_is_dropped() {
        let mut doc = offline_document().await;
        let sent = doc.submit_message(MessageContents::NoOp).unwrap();
        assert_eq!(sent, None);
        assert_eq!(doc.delta_manager().client_sequence_number(), 0);
    }

    #[tokio::test]
    async fn test_attach_and_upload_require_connection() {
        let mut doc = offline_document().await;

        assert!(matches!(
            doc.attach_channel("root", MAP_TYPE),
            Err(DocumentError::NotConnected(_))
        ));
        assert!(doc.addresses().is_empty());

        assert!(matches!(
            doc.upload_blob(b"body", None).await,
            Err(DocumentError::NotConnected(_))
        ));
        assert!(doc.blob_manager().is_empty());
    }
}
