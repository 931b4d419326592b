//! Inbound pipeline and the processing loop.
//!
//! Each sequenced message goes through two passes:
//!
//! 1. **prepare**: chunk reassembly, then the target channel's prepare step
//! 2. **process**: apply to quorum, blobs or the channel, advance the MSN,
//!    approve proposals, emit `op`
//!
//! Runtime requests (submissions from channels, snapshots, close) are handled
//! between messages, never in the middle of one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use quill_core::{content_hash, AttachMessage, MessageContents, SequencedMessage};
use serde_json::Value;

use super::component::CHANNEL_ATTRIBUTES;
use super::{Component, ConnectionState, Document};
use crate::delta::DeltaEvent;
use crate::error::DocumentError;
use crate::events::DocumentEvent;
use crate::handle::RuntimeRequest;
use crate::storage::RuntimeStorageService;

enum Wake {
    Delta(Option<DeltaEvent>),
    Request(Option<RuntimeRequest>),
}

impl Document {
    /// Process everything that is ready without waiting on the transport.
    /// Returns the number of sequenced messages processed.
    pub async fn process_pending(&mut self) -> Result<usize, DocumentError> {
        self.ensure_open()?;
        let mut processed = 0;
        while !self.closed {
            if let Ok(request) = self.requests.try_recv() {
                self.handle_request(request).await;
                continue;
            }
            if let Some(package) = self.pending_transition.take() {
                self.run_transition(package).await;
                continue;
            }
            if let Some(message) = self.delta_manager.dequeue_inbound() {
                if let Err(error) = self.process_inbound(message).await {
                    self.emit_error(error);
                }
                processed += 1;
                continue;
            }
            match self.delta_manager.try_next_event().await {
                Some(event) => self.handle_delta_event(event),
                None => break,
            }
        }
        Ok(processed)
    }

    /// Wait until something happens, then process everything ready.
    /// Returns `false` once no further input can arrive.
    pub async fn run_once(&mut self) -> Result<bool, DocumentError> {
        self.process_pending().await?;
        if self.closed {
            return Ok(false);
        }

        let wake = tokio::select! {
            event = self.delta_manager.next_event() => Wake::Delta(event),
            request = self.requests.recv() => Wake::Request(request),
        };
        match wake {
            Wake::Delta(None) | Wake::Request(None) => return Ok(false),
            Wake::Delta(Some(event)) => self.handle_delta_event(event),
            Wake::Request(Some(request)) => self.handle_request(request).await,
        }

        if self.closed {
            return Ok(false);
        }
        self.process_pending().await?;
        Ok(!self.closed)
    }

    /// Drive the document until it is closed or its stream ends for good.
    pub async fn run(&mut self) -> Result<(), DocumentError> {
        while self.run_once().await? {}
        Ok(())
    }

    async fn handle_request(&mut self, request: RuntimeRequest) {
        let result = match request {
            RuntimeRequest::Submit(contents) => self.submit_message(contents).map(|_| ()),
            RuntimeRequest::Snapshot(tag) => self.snapshot(&tag).await.map(|_| ()),
            RuntimeRequest::Close => {
                self.close();
                Ok(())
            }
        };
        if let Err(error) = result {
            self.emit_error(error);
        }
    }

    fn handle_delta_event(&mut self, event: DeltaEvent) {
        match event {
            DeltaEvent::Connect(details) => {
                self.set_connection_state(
                    ConnectionState::Connecting,
                    "websocket established",
                    Some(details.client_id),
                );
                if let Err(error) = self.send_unacked_chunks() {
                    self.emit_error(error);
                }
            }
            DeltaEvent::Ops(count) => log::trace!("{}: {} ops queued", self.id, count),
            DeltaEvent::Disconnect { nack, reason } => {
                self.set_connection_state(
                    ConnectionState::Disconnected,
                    &format!("nack: {nack}, {reason}"),
                    None,
                );
                self.emit(DocumentEvent::Disconnect);
            }
            DeltaEvent::Pong(latency) => self.emit(DocumentEvent::Pong(latency)),
            DeltaEvent::Error(error) => self.emit_error(error.into()),
        }
    }

    async fn process_inbound(&mut self, mut message: SequencedMessage) -> Result<(), DocumentError> {
        let started = Instant::now();
        let local = self.is_local(&message);

        let context = self.prepare_remote_message(&mut message, local)?;
        self.delta_manager.record_processed(&message);
        self.process_remote_message(&message, local, context).await?;
        self.delta_manager.maybe_send_noop(&message);

        self.emit(DocumentEvent::Op(message));
        self.emit(DocumentEvent::ProcessTime(started.elapsed()));
        Ok(())
    }

    /// First pass. Completed chunk runs are swapped for the message they
    /// carried, which is then prepared in turn.
    fn prepare_remote_message(
        &mut self,
        message: &mut SequencedMessage,
        local: bool,
    ) -> Result<Option<Value>, DocumentError> {
        loop {
            match &message.contents {
                MessageContents::ChunkedOp(chunk) => {
                    let chunk = chunk.clone();
                    let sender = message.client_id.clone().unwrap_or_default();
                    let Some(contents) = self.chunks.add_chunk(&sender, &chunk)? else {
                        return Ok(None);
                    };
                    message.contents = contents;
                    if local {
                        self.unacked_chunks
                            .acknowledge(message.client_sequence_number);
                    }
                }
                MessageContents::Operation(envelope) => {
                    let address = envelope.address.clone();
                    let component = self
                        .components
                        .get_mut(&address)
                        .ok_or_else(|| DocumentError::UnknownChannel(address.clone()))?;
                    return component.prepare(message, local);
                }
                _ => return Ok(None),
            }
        }
    }

    /// Second pass: apply the message to document state.
    async fn process_remote_message(
        &mut self,
        message: &SequencedMessage,
        local: bool,
        context: Option<Value>,
    ) -> Result<(), DocumentError> {
        self.messages_since_msn_change.push_back(message.clone());
        while self
            .messages_since_msn_change
            .front()
            .is_some_and(|m| m.sequence_number <= message.minimum_sequence_number)
        {
            self.messages_since_msn_change.pop_front();
        }

        match &message.contents {
            MessageContents::ClientJoin(join) => {
                self.quorum
                    .add_member(join.client_id.clone(), join.detail.clone());
                if self.connection_state == ConnectionState::Connecting
                    && self.pending_client_id.as_deref() == Some(join.client_id.as_str())
                {
                    self.set_connection_state(
                        ConnectionState::Connected,
                        &format!("joined @ {}", message.sequence_number),
                        None,
                    );
                }
                self.emit(DocumentEvent::ClientJoin(join.clone()));
            }
            MessageContents::ClientLeave(client_id) => {
                if self.chunks.clear(client_id) {
                    log::debug!("{}: dropped partial chunks from {}", self.id, client_id);
                }
                self.quorum.remove_member(client_id);
                self.emit(DocumentEvent::ClientLeave(client_id.clone()));
            }
            MessageContents::Propose(proposal) => self.quorum.add_proposal(
                proposal.key.clone(),
                proposal.value.clone(),
                message.sequence_number,
                local,
                message.client_sequence_number,
                message.client_id.clone(),
            ),
            MessageContents::Reject(sequence_number) => {
                let sender = message.client_id.as_deref().unwrap_or_default();
                self.quorum.reject_proposal(sender, *sequence_number);
            }
            MessageContents::Attach(attach) => self.process_attach(attach, local).await?,
            MessageContents::BlobUploaded(blob) => {
                self.blob_manager.add_blob(blob.clone());
                self.emit(DocumentEvent::BlobUploaded(blob.clone()));
            }
            MessageContents::Operation(envelope) => {
                let component = self
                    .components
                    .get_mut(&envelope.address)
                    .ok_or_else(|| DocumentError::UnknownChannel(envelope.address.clone()))?;
                component.process(message, local, context)?;
            }
            MessageContents::ChunkedOp(_) | MessageContents::NoOp => {}
        }

        for approval in self.quorum.update_minimum_sequence_number(message) {
            self.on_proposal_approved(approval);
        }
        let minimum_sequence_number = message.minimum_sequence_number;
        for component in self.components.values_mut() {
            component.update_min_sequence_number(minimum_sequence_number);
        }
        Ok(())
    }

    /// Instantiate a channel announced by an `attach` message. Our own
    /// attaches already created the channel locally.
    async fn process_attach(
        &mut self,
        attach: &AttachMessage,
        local: bool,
    ) -> Result<(), DocumentError> {
        if self.components.contains_key(&attach.id) {
            if !local {
                log::warn!("{}: ignoring second attach for {}", self.id, attach.id);
            }
            return Ok(());
        }

        let mut blobs = HashMap::new();
        let mut tree = attach.snapshot.to_snapshot_tree(&mut blobs)?;
        if tree.blob(CHANNEL_ATTRIBUTES).is_none() {
            let bytes = serde_json::to_vec(&serde_json::json!({ "type": attach.kind }))?;
            let sha = content_hash(&bytes);
            blobs.insert(sha.clone(), bytes);
            tree.blobs.insert(CHANNEL_ATTRIBUTES.to_string(), sha);
        }

        let storage = Arc::new(RuntimeStorageService::new(self.storage.clone(), blobs));
        let services = self.channel_services(&attach.id, storage);
        let component = Component::load(&tree, &self.chaincode, services, Vec::new()).await?;
        log::info!("{}: attached {} channel {}", self.id, attach.kind, attach.id);
        self.components.insert(attach.id.clone(), component);
        Ok(())
    }
}
