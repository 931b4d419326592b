//! Collaborative text backed by a Yrs document.
//!
//! Local edits apply to the Yrs document immediately and travel as encoded
//! v1 updates. Updates commute, so remote ones can be applied as they are
//! sequenced and a replica converges regardless of local timing.
//!
//! A local update stays pending until it comes back sequenced. Pending
//! updates are sent again on every transition to `Connected`, which covers
//! edits made offline and edits lost with a dropped connection. Applying an
//! update twice is a no-op.

use std::any::Any;

use async_trait::async_trait;
use base64::Engine;
use quill_core::{Blob, MessageContents, SequencedMessage, SnapshotTree, Tree, TreeEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, WriteTxn};

use crate::code::{Channel, ChannelError, ChannelFactory, ChannelServices};
use crate::document::ConnectionState;
use crate::handle::RuntimeHandle;

pub const TEXT_TYPE: &str = "text";

const CONTENT: &str = "content";

/// Wire form of a text op: a base64 encoded Yrs v1 update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextOp {
    pub update: String,
}

pub struct TextChannel {
    address: String,
    handle: RuntimeHandle,
    doc: Doc,
    /// Encoded local updates not yet seen sequenced, oldest first
    pending: Vec<String>,
    connected: bool,
    stopped: bool,
}

impl TextChannel {
    fn new(services: &ChannelServices) -> Self {
        Self {
            address: services.address.clone(),
            handle: services.handle.clone(),
            doc: Doc::new(),
            pending: Vec::new(),
            connected: services.connection_state == ConnectionState::Connected,
            stopped: false,
        }
    }

    pub fn text(&self) -> String {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(CONTENT);
        text.get_string(&txn)
    }

    pub fn len(&self) -> u32 {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(CONTENT);
        text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Local updates still waiting to be sequenced.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn insert(&mut self, index: u32, chunk: &str) -> Result<(), ChannelError> {
        self.ensure_running()?;
        let update = {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(CONTENT);
            text.insert(&mut txn, index, chunk);
            txn.encode_update_v1()
        };
        self.submit_local(&update)
    }

    pub fn remove(&mut self, index: u32, len: u32) -> Result<(), ChannelError> {
        self.ensure_running()?;
        let update = {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(CONTENT);
            text.remove_range(&mut txn, index, len);
            txn.encode_update_v1()
        };
        self.submit_local(&update)
    }

    fn ensure_running(&self) -> Result<(), ChannelError> {
        if self.stopped {
            return Err(ChannelError::Stopped(self.address.clone()));
        }
        Ok(())
    }

    fn submit_local(&mut self, update: &[u8]) -> Result<(), ChannelError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(update);
        if self.connected {
            self.submit(encoded.clone())?;
        } else {
            log::debug!("{}: holding local edit until connected", self.address);
        }
        self.pending.push(encoded);
        Ok(())
    }

    fn submit(&self, update: String) -> Result<(), ChannelError> {
        let op = TextOp { update };
        self.handle.submit(MessageContents::operation(
            self.address.clone(),
            serde_json::to_value(op)?,
        ))?;
        Ok(())
    }

    fn resend_pending(&self) -> Result<(), ChannelError> {
        if !self.pending.is_empty() {
            log::info!("{}: resending {} pending edits", self.address, self.pending.len());
        }
        for update in &self.pending {
            self.submit(update.clone())?;
        }
        Ok(())
    }

    fn apply_update(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        let update = Update::decode_v1(bytes).map_err(|e| ChannelError::Crdt(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| ChannelError::Crdt(e.to_string()))
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }
}

impl Channel for TextChannel {
    fn process(
        &mut self,
        message: &SequencedMessage,
        local: bool,
        _context: Option<Value>,
    ) -> Result<(), ChannelError> {
        let MessageContents::Operation(envelope) = &message.contents else {
            return Ok(());
        };
        let op: TextOp = serde_json::from_value(envelope.contents.clone()).map_err(|e| {
            ChannelError::InvalidOperation {
                address: self.address.clone(),
                reason: e.to_string(),
            }
        })?;

        // Ours may come back under an earlier client id after a reconnect.
        if let Some(index) = self.pending.iter().position(|u| *u == op.update) {
            self.pending.remove(index);
        }
        if local {
            return Ok(());
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&op.update)
            .map_err(|e| ChannelError::InvalidOperation {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
        self.apply_update(&bytes)
    }

    fn snapshot(&self) -> Result<Tree, ChannelError> {
        let mut tree = Tree::new();
        tree.push(TreeEntry::blob(CONTENT, Blob::binary(&self.encode_state())));
        Ok(tree)
    }

    fn change_connection_state(&mut self, state: ConnectionState, _client_id: Option<&str>) {
        let connected = state == ConnectionState::Connected;
        if connected && !self.connected && !self.stopped {
            if let Err(e) = self.resend_pending() {
                log::warn!("{}: could not resend pending edits: {}", self.address, e);
            }
        }
        self.connected = connected;
    }

    fn stop(&mut self) -> Result<Tree, ChannelError> {
        self.stopped = true;
        self.snapshot()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct TextFactory;

#[async_trait]
impl ChannelFactory for TextFactory {
    fn kind(&self) -> &str {
        TEXT_TYPE
    }

    fn create(&self, services: ChannelServices) -> Result<Box<dyn Channel>, ChannelError> {
        Ok(Box::new(TextChannel::new(&services)))
    }

    async fn load(
        &self,
        services: ChannelServices,
        tree: &SnapshotTree,
        history: Vec<SequencedMessage>,
    ) -> Result<Box<dyn Channel>, ChannelError> {
        let state = match tree.blob(CONTENT) {
            Some(sha) => Some(services.storage.read(sha).await?),
            None => None,
        };

        let mut channel = TextChannel::new(&services);
        if let Some(state) = state {
            channel.apply_update(&state)?;
        }
        // Updates are idempotent, so replaying ops the state already holds is harmless.
        for message in &history {
            channel.process(message, false, None)?;
        }
        Ok(Box::new(channel))
    }
}
