//! A channel bound to its address.
//!
//! Each component's snapshot subtree carries a `.channel` blob naming the
//! channel type, so a loader can pick the right factory from the active
//! chaincode.

use quill_core::{Blob, SequencedMessage, SnapshotTree, Tree, TreeEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ConnectionState;
use crate::code::{Chaincode, Channel, ChannelServices};
use crate::error::DocumentError;
use crate::storage::read_and_parse;

pub const CHANNEL_ATTRIBUTES: &str = ".channel";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChannelAttributes {
    #[serde(rename = "type")]
    kind: String,
}

pub struct Component {
    address: String,
    kind: String,
    channel: Box<dyn Channel>,
}

impl Component {
    /// A new, empty channel of `kind`.
    pub fn create(
        kind: &str,
        chaincode: &Chaincode,
        services: ChannelServices,
    ) -> Result<Self, DocumentError> {
        let address = services.address.clone();
        let channel = chaincode.factory(kind)?.create(services)?;
        Ok(Self {
            address,
            kind: kind.to_string(),
            channel,
        })
    }

    /// Rebuild from a snapshot subtree.
    pub async fn load(
        tree: &SnapshotTree,
        chaincode: &Chaincode,
        services: ChannelServices,
        history: Vec<SequencedMessage>,
    ) -> Result<Self, DocumentError> {
        let address = services.address.clone();
        let sha = tree
            .blob(CHANNEL_ATTRIBUTES)
            .ok_or_else(|| DocumentError::MissingBlob(format!("{address}/{CHANNEL_ATTRIBUTES}")))?;
        let attributes: ChannelAttributes = read_and_parse(services.storage.as_ref(), sha).await?;

        let factory = chaincode.factory(&attributes.kind)?;
        let channel = factory.load(services, tree, history).await?;
        log::debug!("loaded {} channel at {}", attributes.kind, address);

        Ok(Self {
            address,
            kind: attributes.kind,
            channel,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> &mut dyn Channel {
        self.channel.as_mut()
    }

    pub fn snapshot(&self) -> Result<Tree, DocumentError> {
        let tree = self.channel.snapshot()?;
        self.with_attributes(tree)
    }

    pub fn stop(&mut self) -> Result<Tree, DocumentError> {
        let tree = self.channel.stop()?;
        self.with_attributes(tree)
    }

    fn with_attributes(&self, mut tree: Tree) -> Result<Tree, DocumentError> {
        tree.push(TreeEntry::blob(
            CHANNEL_ATTRIBUTES,
            Blob::json(&ChannelAttributes {
                kind: self.kind.clone(),
            })?,
        ));
        Ok(tree)
    }

    pub fn prepare(
        &mut self,
        message: &SequencedMessage,
        local: bool,
    ) -> Result<Option<Value>, DocumentError> {
        Ok(self.channel.prepare(message, local)?)
    }

    pub fn process(
        &mut self,
        message: &SequencedMessage,
        local: bool,
        context: Option<Value>,
    ) -> Result<(), DocumentError> {
        Ok(self.channel.process(message, local, context)?)
    }

    pub fn transform(&self, message: &mut SequencedMessage, sequence_number: u64) {
        self.channel.transform(message, sequence_number);
    }

    pub fn change_connection_state(&mut self, state: ConnectionState, client_id: Option<&str>) {
        self.channel.change_connection_state(state, client_id);
    }

    pub fn update_min_sequence_number(&mut self, minimum_sequence_number: u64) {
        self.channel.update_min_sequence_number(minimum_sequence_number);
    }
}
