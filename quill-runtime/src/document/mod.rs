//! The document: a live replica of one collaborative document.
//!
//! ```text
//!            ┌────────────── Document ───────────────┐
//!  storage ─►│ quorum   blobs   components{address}  │
//!            │    ▲                  ▲               │
//!            │    └── process ◄── inbound ◄── DeltaManager ◄── ordering service
//!            │                                       │
//!  host ───► │ submit ─► chunking ─► outbound ───────┼──► ordering service
//!            └───────────────────────────────────────┘
//! ```
//!
//! A document is driven by its owner: [`Document::process_pending`] drains
//! everything that is ready, [`Document::run`] keeps going until closed.
//!
//! ## Modules
//!
//! - `load`: assembling a document from storage and the delta stream
//! - `connection`: connection state machine, submission and chunking
//! - `process`: inbound message pipeline and the event loop
//! - `snapshot`: writing snapshots
//! - `runtime`: code package resolution and runtime transitions
//! - [`component`]: a channel bound to its address

pub mod component;
mod connection;
mod load;
mod process;
mod runtime;
mod snapshot;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use quill_core::{BlobMetadata, ClientId, MessageContents, SequencedMessage, User};
use serde_json::Value;
use tokio::sync::mpsc;

pub use component::Component;
pub use connection::ConnectionState;
pub use load::LoadRequest;
pub use runtime::CODE_KEY;

use crate::blob::BlobManager;
use crate::chunk::{ChunkReassembler, UnackedChunks};
use crate::code::{Chaincode, Channel, ChannelServices, CodeLoader};
use crate::delta::DeltaManager;
use crate::error::DocumentError;
use crate::events::{DocumentEvent, ListenerId, Listeners};
use crate::handle::{RuntimeHandle, RuntimeRequest};
use crate::options::DocumentOptions;
use crate::quorum::Quorum;
use crate::storage::DocumentStorageService;

pub struct Document {
    id: String,
    tenant_id: String,
    user: User,
    options: DocumentOptions,
    code_loader: Arc<dyn CodeLoader>,
    storage: Arc<dyn DocumentStorageService>,

    delta_manager: DeltaManager,
    quorum: Quorum,
    blob_manager: BlobManager,
    components: BTreeMap<String, Component>,
    chaincode: Chaincode,

    chunks: ChunkReassembler,
    unacked_chunks: UnackedChunks,
    /// Ops above the current MSN, written to `.messages` on snapshot
    messages_since_msn_change: VecDeque<SequencedMessage>,

    connection_state: ConnectionState,
    pending_client_id: Option<ClientId>,
    client_id: Option<ClientId>,
    existing: bool,
    parent_branch: Option<String>,
    /// Head of the document's own snapshot history
    last_version: Option<String>,

    loaded: bool,
    closed: bool,
    listeners: Listeners<DocumentEvent>,
    handle: RuntimeHandle,
    requests: mpsc::UnboundedReceiver<RuntimeRequest>,
    pending_transition: Option<String>,
    failed_transition: Option<String>,
}

impl Document {
    // ─── Identity ───────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn options(&self) -> &DocumentOptions {
        &self.options
    }

    /// Id assigned by the ordering service once our join was sequenced.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn existing(&self) -> bool {
        self.existing
    }

    /// Parent branch when this document is a fork.
    pub fn parent_branch(&self) -> Option<&str> {
        self.parent_branch.as_deref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Package currently hosting the channels.
    pub fn package(&self) -> Option<&str> {
        self.chaincode.package()
    }

    // ─── Subsystems ─────────────────────────────────────────

    pub fn delta_manager(&self) -> &DeltaManager {
        &self.delta_manager
    }

    pub fn quorum(&self) -> &Quorum {
        &self.quorum
    }

    pub fn quorum_mut(&mut self) -> &mut Quorum {
        &mut self.quorum
    }

    pub fn blob_manager(&self) -> &BlobManager {
        &self.blob_manager
    }

    pub fn storage(&self) -> Arc<dyn DocumentStorageService> {
        self.storage.clone()
    }

    /// Handle for queueing requests from outside the processing loop.
    pub fn runtime_handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    // ─── Channels ───────────────────────────────────────────

    pub fn addresses(&self) -> Vec<String> {
        self.components.keys().cloned().collect()
    }

    pub fn component(&self, address: &str) -> Option<&Component> {
        self.components.get(address)
    }

    pub fn channel(&self, address: &str) -> Option<&dyn Channel> {
        self.components.get(address).map(Component::channel)
    }

    /// Typed access to a channel.
    pub fn channel_as<T: 'static>(&self, address: &str) -> Option<&T> {
        self.channel(address)?.as_any().downcast_ref::<T>()
    }

    pub fn channel_as_mut<T: 'static>(&mut self, address: &str) -> Option<&mut T> {
        self.components
            .get_mut(address)?
            .channel_mut()
            .as_any_mut()
            .downcast_mut::<T>()
    }

    /// Create a channel locally and announce it with an `attach` message.
    ///
    /// Fails with [`DocumentError::NotConnected`] unless connected, since an
    /// unannounced channel would exist on this replica only.
    pub fn attach_channel(&mut self, address: &str, kind: &str) -> Result<(), DocumentError> {
        self.ensure_open()?;
        self.ensure_connected()?;
        if self.components.contains_key(address) {
            return Err(DocumentError::ChannelExists(address.to_string()));
        }
        let services = self.channel_services(address, self.storage.clone());
        let component = Component::create(kind, &self.chaincode, services)?;
        let snapshot = component.snapshot()?;
        self.components.insert(address.to_string(), component);

        self.submit_message(MessageContents::Attach(quill_core::AttachMessage {
            id: address.to_string(),
            kind: kind.to_string(),
            snapshot,
        }))?;
        Ok(())
    }

    // ─── Host operations ────────────────────────────────────

    /// Submit an op for the channel at `address`.
    pub fn submit_operation(
        &mut self,
        address: &str,
        contents: Value,
    ) -> Result<Option<u64>, DocumentError> {
        self.ensure_open()?;
        if !self.components.contains_key(address) {
            return Err(DocumentError::UnknownChannel(address.to_string()));
        }
        self.submit_message(MessageContents::operation(address, contents))
    }

    /// Propose a quorum value.
    pub fn propose(&mut self, key: &str, value: Value) -> Result<Option<u64>, DocumentError> {
        self.ensure_open()?;
        self.submit_message(MessageContents::Propose(quill_core::Proposal {
            key: key.to_string(),
            value,
        }))
    }

    /// Upload bytes and announce them with a `blobUploaded` message.
    ///
    /// Nothing is stored unless connected, so every upload is announced.
    pub async fn upload_blob(
        &mut self,
        bytes: &[u8],
        file_name: Option<String>,
    ) -> Result<BlobMetadata, DocumentError> {
        self.ensure_open()?;
        self.ensure_connected()?;
        let metadata = self.blob_manager.create_blob(bytes, file_name).await?;
        self.submit_message(MessageContents::BlobUploaded(metadata.clone()))?;
        Ok(metadata)
    }

    // ─── Events ─────────────────────────────────────────────

    pub fn on<F>(&mut self, callback: F) -> ListenerId
    where
        F: FnMut(&DocumentEvent) + Send + 'static,
    {
        self.listeners.on(callback)
    }

    pub fn off(&mut self, id: ListenerId) -> bool {
        self.listeners.off(id)
    }

    /// Receive every event on a channel instead of a callback.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DocumentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.on(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    fn emit(&mut self, event: DocumentEvent) {
        self.listeners.emit(&event);
    }

    fn emit_error(&mut self, error: DocumentError) {
        log::error!("{}: {}", self.id, error);
        self.emit(DocumentEvent::Error(Arc::new(error)));
    }

    // ─── Lifecycle ──────────────────────────────────────────

    /// Disconnect and drop every listener. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.delta_manager.close();
        self.listeners.clear();
        log::info!("{}: closed", self.id);
    }

    fn ensure_open(&self) -> Result<(), DocumentError> {
        if self.closed {
            return Err(DocumentError::Closed(self.id.clone()));
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), DocumentError> {
        if self.connection_state != ConnectionState::Connected {
            return Err(DocumentError::NotConnected(self.id.clone()));
        }
        Ok(())
    }

    fn channel_services(
        &self,
        address: &str,
        storage: Arc<dyn DocumentStorageService>,
    ) -> ChannelServices {
        ChannelServices {
            address: address.to_string(),
            document_id: self.id.clone(),
            branch: self.id.clone(),
            storage,
            handle: self.handle.clone(),
            client_id: self.client_id.clone(),
            connection_state: self.connection_state,
            minimum_sequence_number: self.delta_manager.minimum_sequence_number(),
            existing: self.existing,
        }
    }

    fn is_local(&self, message: &SequencedMessage) -> bool {
        match (&self.client_id, &message.client_id) {
            (Some(ours), Some(sender)) => ours == sender,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("connection_state", &self.connection_state)
            .field("package", &self.chaincode.package())
            .field("channels", &self.components.keys().collect::<Vec<_>>())
            .finish()
    }
}
