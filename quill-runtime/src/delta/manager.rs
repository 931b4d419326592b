//! The delta manager: one document's view of the ordered op stream.
//!
//! ```text
//!  connection ──Ops──► pending (by seq) ──contiguous──► inbound ──► document
//!      ▲                   │ gap                          (pausable)
//!      │                   ▼
//!      │             delta storage get(last, first_pending)
//!      │
//!  outbound (pausable) ◄── submit(contents) stamps clientSeq / refSeq
//! ```
//!
//! Guarantees:
//! - inbound ops are handed out exactly once, in sequence order, with no gaps
//! - the minimum sequence number never regresses
//! - client sequence numbers restart at 1 on every new connection

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use quill_core::{ClientDetail, DocumentMessage, MessageContents, MessageType, SequencedMessage};
use tokio::sync::mpsc::{self, error::TryRecvError};

use super::connection::{
    ConnectionDetails, ConnectionEvent, DeltaConnection, DeltaError, DeltaStorageService,
};
use super::queue::DeltaQueue;
use crate::options::DocumentOptions;
use crate::service::{DocumentService, TokenProvider};

/// Events surfaced to the document loop.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaEvent {
    /// A reconnect finished its handshake
    Connect(ConnectionDetails),
    /// This many ops became available on the inbound queue
    Ops(usize),
    Disconnect { nack: bool, reason: String },
    Pong(u64),
    Error(DeltaError),
}

pub struct DeltaManager {
    document_id: String,
    tenant_id: String,
    service: Arc<dyn DocumentService>,
    tokens: Arc<dyn TokenProvider>,
    delta_storage: Arc<dyn DeltaStorageService>,
    client: ClientDetail,

    connection: Option<Box<dyn DeltaConnection>>,
    event_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    details: Option<ConnectionDetails>,

    inbound: DeltaQueue<SequencedMessage>,
    outbound: DeltaQueue<DocumentMessage>,
    /// Ops held back by a gap, or received before the handler attached
    pending: BTreeMap<u64, SequencedMessage>,
    handler_attached: bool,

    base_sequence_number: u64,
    last_queued_sequence_number: u64,
    reference_sequence_number: u64,
    minimum_sequence_number: u64,
    client_sequence_number: u64,
    max_message_size: usize,
    default_max_message_size: usize,
    readonly: bool,

    noop_frequency: Option<u64>,
    ops_since_submit: u64,

    auto_reconnect: bool,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
    needs_reconnect: bool,
    closed: bool,
    pending_events: VecDeque<DeltaEvent>,
}

impl DeltaManager {
    /// Both queues start paused; the document resumes them once loaded.
    pub fn new(
        document_id: impl Into<String>,
        tenant_id: impl Into<String>,
        service: Arc<dyn DocumentService>,
        tokens: Arc<dyn TokenProvider>,
        delta_storage: Arc<dyn DeltaStorageService>,
        options: &DocumentOptions,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            tenant_id: tenant_id.into(),
            service,
            tokens,
            delta_storage,
            client: options.client.clone(),
            connection: None,
            event_rx: None,
            details: None,
            inbound: DeltaQueue::new(true),
            outbound: DeltaQueue::new(true),
            pending: BTreeMap::new(),
            handler_attached: false,
            base_sequence_number: 0,
            last_queued_sequence_number: 0,
            reference_sequence_number: 0,
            minimum_sequence_number: 0,
            client_sequence_number: 0,
            max_message_size: options.default_max_message_size,
            default_max_message_size: options.default_max_message_size,
            readonly: true,
            noop_frequency: options.noop_frequency,
            ops_since_submit: 0,
            auto_reconnect: options.reconnect,
            reconnect_delay: options.reconnect_delay(),
            max_reconnect_attempts: options.max_reconnect_attempts,
            needs_reconnect: false,
            closed: false,
            pending_events: VecDeque::new(),
        }
    }

    // ─── Connection ─────────────────────────────────────────

    /// Open the delta stream. The connection starts read-only until the
    /// document sees its own join sequenced.
    pub async fn connect(&mut self, reason: &str) -> Result<ConnectionDetails, DeltaError> {
        if self.closed {
            return Err(DeltaError::Closed);
        }
        log::info!("{}: connecting ({})", self.document_id, reason);

        let mut connection = self
            .service
            .connect_to_delta_stream(
                &self.tenant_id,
                &self.document_id,
                self.tokens.as_ref(),
                &self.client,
            )
            .await?;
        let details = connection.details().clone();

        self.event_rx = connection.take_event_rx();
        self.connection = Some(connection);
        self.client_sequence_number = 0;
        self.ops_since_submit = 0;
        self.readonly = true;
        self.max_message_size = if details.max_message_size == 0 {
            self.default_max_message_size
        } else {
            details.max_message_size
        };
        self.enqueue_messages(details.initial_messages.clone());
        self.details = Some(details.clone());

        log::info!(
            "{}: connected as {} (existing: {}, max message size: {})",
            self.document_id,
            details.client_id,
            details.existing,
            self.max_message_size
        );
        Ok(details)
    }

    /// Start delivering ops after `sequence_number`, the sequence number the
    /// loaded snapshot covers. Fetches everything stored since then.
    pub async fn attach_op_handler(&mut self, sequence_number: u64) -> Result<(), DeltaError> {
        self.handler_attached = true;
        self.base_sequence_number = sequence_number;
        self.last_queued_sequence_number = sequence_number;
        self.reference_sequence_number = sequence_number;
        self.pending = self.pending.split_off(&(sequence_number + 1));

        let queued = self.catch_up().await?;
        log::debug!(
            "{}: op handler attached at {} ({} ops queued)",
            self.document_id,
            sequence_number,
            queued
        );
        Ok(())
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.needs_reconnect = false;
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.event_rx = None;
        self.inbound.pause();
        self.outbound.pause();
        log::info!("{}: delta manager closed", self.document_id);
    }

    fn disconnected(&mut self, nack: bool, reason: String) -> DeltaEvent {
        log::warn!(
            "{}: disconnected (nack: {}): {}",
            self.document_id,
            nack,
            reason
        );
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.event_rx = None;
        self.details = None;
        self.readonly = true;
        if !self.outbound.is_empty() {
            log::warn!(
                "{}: dropping {} unsent messages",
                self.document_id,
                self.outbound.len()
            );
            self.outbound.clear();
        }
        self.needs_reconnect = self.auto_reconnect && !self.closed;
        DeltaEvent::Disconnect { nack, reason }
    }

    async fn reconnect(&mut self) -> Result<ConnectionDetails, DeltaError> {
        for attempt in 1..=self.max_reconnect_attempts {
            if !self.reconnect_delay.is_zero() {
                tokio::time::sleep(self.reconnect_delay).await;
            }
            match self.connect("reconnect").await {
                Ok(details) => {
                    if self.handler_attached {
                        self.catch_up().await?;
                    }
                    return Ok(details);
                }
                Err(e) => log::warn!(
                    "{}: reconnect attempt {} failed: {}",
                    self.document_id,
                    attempt,
                    e
                ),
            }
        }
        Err(DeltaError::ReconnectExhausted(self.max_reconnect_attempts))
    }

    // ─── Events ─────────────────────────────────────────────

    /// Wait for the next event. `None` means no further events will arrive.
    pub async fn next_event(&mut self) -> Option<DeltaEvent> {
        self.poll_event(true).await
    }

    /// Next event if one is ready, without waiting on the transport.
    pub async fn try_next_event(&mut self) -> Option<DeltaEvent> {
        self.poll_event(false).await
    }

    async fn poll_event(&mut self, wait: bool) -> Option<DeltaEvent> {
        if let Some(event) = self.pending_events.pop_front() {
            return Some(event);
        }
        if self.closed {
            return None;
        }
        // Cleared only once the attempt completes: the caller may drop this
        // future while it waits.
        if self.needs_reconnect {
            let result = self.reconnect().await;
            self.needs_reconnect = false;
            return Some(match result {
                Ok(details) => DeltaEvent::Connect(details),
                Err(e) => DeltaEvent::Error(e),
            });
        }
        if self.missing_range().is_some() {
            match self.fill_gaps().await {
                Ok(0) => {}
                Ok(filled) => return Some(DeltaEvent::Ops(filled)),
                Err(e) => return Some(DeltaEvent::Error(e)),
            }
        }

        let rx = self.event_rx.as_mut()?;
        let event = if wait {
            rx.recv().await
        } else {
            match rx.try_recv() {
                Ok(event) => Some(event),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => None,
            }
        };

        Some(match event {
            Some(ConnectionEvent::Ops(messages)) => {
                let queued = self.enqueue_messages(messages);
                match self.fill_gaps().await {
                    Ok(filled) => DeltaEvent::Ops(queued + filled),
                    Err(e) => DeltaEvent::Error(e),
                }
            }
            Some(ConnectionEvent::Pong(latency)) => DeltaEvent::Pong(latency),
            Some(ConnectionEvent::Nack(reason)) => self.disconnected(true, reason),
            Some(ConnectionEvent::Disconnect(reason)) => self.disconnected(false, reason),
            None => self.disconnected(false, "delta stream ended".to_string()),
        })
    }

    // ─── Inbound ────────────────────────────────────────────

    /// Accept ops from any source. Duplicates are dropped; ops ahead of a
    /// gap wait in `pending`. Returns how many reached the inbound queue.
    pub fn enqueue_messages(&mut self, messages: Vec<SequencedMessage>) -> usize {
        for message in messages {
            if self.handler_attached && message.sequence_number <= self.last_queued_sequence_number
            {
                log::trace!("dropping duplicate op {}", message.sequence_number);
                continue;
            }
            self.pending.insert(message.sequence_number, message);
        }
        if !self.handler_attached {
            return 0;
        }
        self.drain_contiguous()
    }

    fn drain_contiguous(&mut self) -> usize {
        let mut queued = 0;
        while let Some(message) = self
            .pending
            .remove(&(self.last_queued_sequence_number + 1))
        {
            self.last_queued_sequence_number = message.sequence_number;
            self.inbound.push(message);
            queued += 1;
        }
        queued
    }

    /// `(last_queued, first_pending)` when ops are missing in between.
    pub fn missing_range(&self) -> Option<(u64, u64)> {
        let first = *self.pending.keys().next()?;
        (self.handler_attached && first > self.last_queued_sequence_number + 1)
            .then_some((self.last_queued_sequence_number, first))
    }

    async fn fill_gaps(&mut self) -> Result<usize, DeltaError> {
        let mut queued = 0;
        while let Some((from, to)) = self.missing_range() {
            log::info!(
                "{}: fetching missing ops {}..{}",
                self.document_id,
                from,
                to
            );
            let fetched = self.delta_storage.get(from, Some(to)).await?;
            queued += self.enqueue_messages(fetched);
            if self.last_queued_sequence_number == from {
                log::warn!(
                    "{}: delta storage could not fill {}..{}",
                    self.document_id,
                    from,
                    to
                );
                break;
            }
        }
        Ok(queued)
    }

    async fn catch_up(&mut self) -> Result<usize, DeltaError> {
        let fetched = self
            .delta_storage
            .get(self.last_queued_sequence_number, None)
            .await?;
        Ok(self.enqueue_messages(fetched) + self.fill_gaps().await?)
    }

    /// Next op to process, unless inbound is paused.
    pub fn dequeue_inbound(&mut self) -> Option<SequencedMessage> {
        self.inbound.pop()
    }

    /// Record that `message` is being applied: it becomes the reference
    /// sequence number and its MSN the current one.
    pub fn record_processed(&mut self, message: &SequencedMessage) {
        self.reference_sequence_number = message.sequence_number;
        if message.minimum_sequence_number < self.minimum_sequence_number {
            log::warn!(
                "{}: op {} carries regressed MSN {} (< {})",
                self.document_id,
                message.sequence_number,
                message.minimum_sequence_number,
                self.minimum_sequence_number
            );
        } else {
            self.minimum_sequence_number = message.minimum_sequence_number;
        }
    }

    /// Count a processed op and send a `noOp` once `noop_frequency` ops went
    /// by without a local submit, so the MSN can advance past them.
    pub fn maybe_send_noop(&mut self, message: &SequencedMessage) -> Option<u64> {
        if message.kind() == MessageType::NoOp {
            return None;
        }
        self.ops_since_submit += 1;
        let frequency = self.noop_frequency?;
        if self.ops_since_submit < frequency || self.readonly || self.connection.is_none() {
            return None;
        }
        match self.submit(MessageContents::NoOp) {
            Ok(csn) => Some(csn),
            Err(e) => {
                log::warn!("{}: noOp submit failed: {}", self.document_id, e);
                None
            }
        }
    }

    // ─── Outbound ───────────────────────────────────────────

    /// Stamp and send `contents`. Returns its client sequence number.
    pub fn submit(&mut self, contents: MessageContents) -> Result<u64, DeltaError> {
        if self.closed {
            return Err(DeltaError::Closed);
        }
        if self.connection.is_none() {
            return Err(DeltaError::NotConnected);
        }
        self.client_sequence_number += 1;
        self.ops_since_submit = 0;
        self.outbound.push(DocumentMessage {
            client_sequence_number: self.client_sequence_number,
            reference_sequence_number: self.reference_sequence_number,
            contents,
        });
        self.flush()?;
        Ok(self.client_sequence_number)
    }

    /// Push queued outbound messages to the connection unless paused.
    pub fn flush(&mut self) -> Result<usize, DeltaError> {
        if self.outbound.is_paused() || self.outbound.is_empty() {
            return Ok(0);
        }
        let Some(connection) = self.connection.as_mut() else {
            return Ok(0);
        };
        let batch = self.outbound.drain_all();
        let count = batch.len();
        connection.submit(batch)?;
        Ok(count)
    }

    /// Historical ops with `from < seq < to`.
    pub async fn get_deltas(
        &self,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<SequencedMessage>, DeltaError> {
        self.delta_storage.get(from, to).await
    }

    // ─── Flow control ───────────────────────────────────────

    pub fn pause_inbound(&mut self) {
        self.inbound.pause();
    }

    pub fn resume_inbound(&mut self) {
        if !self.closed {
            self.inbound.resume();
        }
    }

    pub fn is_inbound_paused(&self) -> bool {
        self.inbound.is_paused()
    }

    pub fn pause_outbound(&mut self) {
        self.outbound.pause();
    }

    pub fn resume_outbound(&mut self) -> Result<usize, DeltaError> {
        if self.closed {
            return Ok(0);
        }
        self.outbound.resume();
        self.flush()
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    // ─── Accessors ──────────────────────────────────────────

    pub fn set_minimum_sequence_number(&mut self, minimum_sequence_number: u64) {
        self.minimum_sequence_number = minimum_sequence_number;
    }

    pub fn disable_readonly_mode(&mut self) {
        self.readonly = false;
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn client_id(&self) -> Option<&str> {
        self.details.as_ref().map(|d| d.client_id.as_str())
    }

    pub fn details(&self) -> Option<&ConnectionDetails> {
        self.details.as_ref()
    }

    pub fn base_sequence_number(&self) -> u64 {
        self.base_sequence_number
    }

    pub fn last_queued_sequence_number(&self) -> u64 {
        self.last_queued_sequence_number
    }

    pub fn reference_sequence_number(&self) -> u64 {
        self.reference_sequence_number
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.minimum_sequence_number
    }

    pub fn client_sequence_number(&self) -> u64 {
        self.client_sequence_number
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl std::fmt::Debug for DeltaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaManager")
            .field("document_id", &self.document_id)
            .field("client_id", &self.client_id())
            .field("reference_sequence_number", &self.reference_sequence_number)
            .field("minimum_sequence_number", &self.minimum_sequence_number)
            .field("inbound", &self.inbound.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
