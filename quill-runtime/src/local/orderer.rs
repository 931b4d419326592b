//! In-process ordering service for one document.
//!
//! Every submission from every connected client is stamped into a single
//! gapless log and fanned out to all connections, the submitter included.
//!
//! ```text
//!  client A ──submit──┐
//!                      ▼
//!  client B ──submit──► LocalOrderer ──Ops──► A, B, C …
//!                      │  seq += 1, msn = min(ref seq of clients)
//!                      ▼
//!                     log (served to delta storage reads)
//! ```
//!
//! The MSN never regresses; with no clients connected it follows the head
//! of the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use quill_core::{
    ClientDetail, ClientId, ClientJoin, DocumentMessage, MessageContents, SequencedMessage,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::delta::{ConnectionDetails, ConnectionEvent, DeltaConnection, DeltaError};

/// Snapshot of orderer state for monitoring and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrdererStats {
    pub sequence_number: u64,
    pub minimum_sequence_number: u64,
    pub connected_clients: usize,
    pub log_len: usize,
    pub nacks: u64,
}

struct ClientState {
    reference_sequence_number: u64,
    sender: mpsc::UnboundedSender<ConnectionEvent>,
}

#[derive(Default)]
struct OrdererState {
    sequence_number: u64,
    minimum_sequence_number: u64,
    log: Vec<SequencedMessage>,
    clients: HashMap<ClientId, ClientState>,
    nacks: u64,
}

impl OrdererState {
    /// Stamp one message and append it to the log.
    fn sequence(
        &mut self,
        client_id: Option<&str>,
        client_sequence_number: u64,
        reference_sequence_number: u64,
        contents: MessageContents,
    ) -> SequencedMessage {
        self.sequence_number += 1;
        if let Some(client) = client_id.and_then(|id| self.clients.get_mut(id)) {
            client.reference_sequence_number = reference_sequence_number;
        }

        let floor = self
            .clients
            .values()
            .map(|c| c.reference_sequence_number)
            .min()
            .unwrap_or(self.sequence_number);
        self.minimum_sequence_number = self.minimum_sequence_number.max(floor);

        let message = SequencedMessage {
            sequence_number: self.sequence_number,
            minimum_sequence_number: self.minimum_sequence_number,
            client_id: client_id.map(str::to_string),
            client_sequence_number,
            reference_sequence_number,
            origin: None,
            timestamp: now_millis(),
            contents,
        };
        self.log.push(message.clone());
        message
    }

    fn broadcast(&self, messages: Vec<SequencedMessage>) {
        if messages.is_empty() {
            return;
        }
        for client in self.clients.values() {
            // A receiver that went away is cleaned up when its connection closes
            let _ = client.sender.send(ConnectionEvent::Ops(messages.clone()));
        }
    }

    /// Drop `client_id` and sequence its departure. Returns false if the
    /// client was already gone.
    fn leave(&mut self, client_id: &str) -> bool {
        if self.clients.remove(client_id).is_none() {
            return false;
        }
        let sequence_number = self.sequence_number;
        let message = self.sequence(
            None,
            0,
            sequence_number,
            MessageContents::ClientLeave(client_id.to_string()),
        );
        self.broadcast(vec![message]);
        true
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Sequencer for a single document.
pub struct LocalOrderer {
    document_id: String,
    max_message_size: usize,
    state: Mutex<OrdererState>,
}

impl LocalOrderer {
    pub fn new(document_id: impl Into<String>, max_message_size: usize) -> Self {
        Self {
            document_id: document_id.into(),
            max_message_size,
            state: Mutex::new(OrdererState::default()),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    fn lock(&self) -> MutexGuard<'_, OrdererState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new client and sequence its `clientJoin`.
    ///
    /// The client's reference sequence number starts at the current MSN, so
    /// its arrival never moves the MSN forward on its own.
    pub fn connect(self: &Arc<Self>, detail: &ClientDetail, existing: bool) -> LocalConnection {
        let client_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut state = self.lock();
        let existing = existing || !state.log.is_empty();
        let minimum_sequence_number = state.minimum_sequence_number;
        state.clients.insert(
            client_id.clone(),
            ClientState {
                reference_sequence_number: minimum_sequence_number,
                sender,
            },
        );
        let sequence_number = state.sequence_number;
        let join = state.sequence(
            None,
            0,
            sequence_number,
            MessageContents::ClientJoin(ClientJoin {
                client_id: client_id.clone(),
                detail: detail.clone(),
            }),
        );
        state.broadcast(vec![join]);
        drop(state);

        log::info!("{}: client {} joined", self.document_id, client_id);
        LocalConnection {
            orderer: Arc::clone(self),
            details: ConnectionDetails {
                client_id,
                existing,
                parent_branch: None,
                max_message_size: self.max_message_size,
                initial_messages: Vec::new(),
            },
            event_rx: Some(receiver),
            closed: false,
        }
    }

    /// Sequence a batch from `client_id`. Oversized payloads and
    /// client-sent system messages get the client nacked instead.
    pub fn submit(&self, client_id: &str, messages: Vec<DocumentMessage>) -> Result<(), DeltaError> {
        let mut state = self.lock();
        if !state.clients.contains_key(client_id) {
            return Err(DeltaError::NotConnected);
        }

        let mut sequenced = Vec::with_capacity(messages.len());
        let mut rejection = None;
        for message in messages {
            if let Some(reason) = self.reject_reason(&message) {
                rejection = Some(reason);
                break;
            }
            sequenced.push(state.sequence(
                Some(client_id),
                message.client_sequence_number,
                message.reference_sequence_number,
                message.contents,
            ));
        }
        state.broadcast(sequenced);

        if let Some(reason) = rejection {
            log::warn!("{}: nacking {}: {}", self.document_id, client_id, reason);
            state.nacks += 1;
            if let Some(client) = state.clients.get(client_id) {
                let _ = client.sender.send(ConnectionEvent::Nack(reason));
            }
            state.leave(client_id);
        }
        Ok(())
    }

    fn reject_reason(&self, message: &DocumentMessage) -> Option<String> {
        match &message.contents {
            MessageContents::ClientJoin(_) | MessageContents::ClientLeave(_) => {
                return Some(format!("{} is reserved for the service", message.contents.kind()));
            }
            MessageContents::NoOp => return None,
            _ => {}
        }
        // A chunk is measured by the slice it carries, not its JSON framing
        let size = match &message.contents {
            MessageContents::ChunkedOp(chunk) => chunk.contents.len(),
            contents => match contents.serialized_payload() {
                Ok(payload) => payload.len(),
                Err(e) => return Some(format!("unserializable message: {e}")),
            },
        };
        (size > self.max_message_size).then(|| {
            format!(
                "message of {} bytes exceeds limit of {}",
                size, self.max_message_size
            )
        })
    }

    /// Sever `client_id` from the service side. The client sees a plain
    /// disconnect and the others see it leave.
    pub fn disconnect(&self, client_id: &str, reason: &str) -> bool {
        let mut state = self.lock();
        if let Some(client) = state.clients.get(client_id) {
            let _ = client
                .sender
                .send(ConnectionEvent::Disconnect(reason.to_string()));
        }
        state.leave(client_id)
    }

    /// Report a round trip to `client_id`.
    pub fn pong(&self, client_id: &str, latency_ms: u64) -> bool {
        let state = self.lock();
        state
            .clients
            .get(client_id)
            .is_some_and(|c| c.sender.send(ConnectionEvent::Pong(latency_ms)).is_ok())
    }

    fn leave(&self, client_id: &str) {
        if self.lock().leave(client_id) {
            log::info!("{}: client {} left", self.document_id, client_id);
        }
    }

    /// Logged ops with `from < seq < to`.
    pub fn get(&self, from: u64, to: Option<u64>) -> Vec<SequencedMessage> {
        let state = self.lock();
        let to = to.unwrap_or(u64::MAX);
        state
            .log
            .iter()
            .filter(|m| m.sequence_number > from && m.sequence_number < to)
            .cloned()
            .collect()
    }

    pub fn connected_clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<_> = self.lock().clients.keys().cloned().collect();
        clients.sort();
        clients
    }

    pub fn stats(&self) -> OrdererStats {
        let state = self.lock();
        OrdererStats {
            sequence_number: state.sequence_number,
            minimum_sequence_number: state.minimum_sequence_number,
            connected_clients: state.clients.len(),
            log_len: state.log.len(),
            nacks: state.nacks,
        }
    }
}

/// A client's end of a [`LocalOrderer`]. Closing, or dropping, leaves the
/// session exactly once.
pub struct LocalConnection {
    orderer: Arc<LocalOrderer>,
    details: ConnectionDetails,
    event_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    closed: bool,
}

impl DeltaConnection for LocalConnection {
    fn details(&self) -> &ConnectionDetails {
        &self.details
    }

    fn submit(&mut self, messages: Vec<DocumentMessage>) -> Result<(), DeltaError> {
        if self.closed {
            return Err(DeltaError::Closed);
        }
        // Writes after the service dropped us vanish; the disconnect event
        // is already on its way.
        match self.orderer.submit(&self.details.client_id, messages) {
            Err(DeltaError::NotConnected) => {
                log::debug!(
                    "{}: {} dropped by the service, discarding submission",
                    self.orderer.document_id,
                    self.details.client_id
                );
                Ok(())
            }
            other => other,
        }
    }

    fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.orderer.leave(&self.details.client_id);
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.close();
    }
}
