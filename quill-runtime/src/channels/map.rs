//! Last-writer-wins map.
//!
//! Ops apply in sequence order, so the last sequenced `set` for a key wins on
//! every replica. Local writes are not applied optimistically; they show up
//! once sequenced.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use quill_core::{Blob, ClientId, MessageContents, SequencedMessage, SnapshotTree, Tree, TreeEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::code::{Channel, ChannelError, ChannelFactory, ChannelServices};
use crate::handle::RuntimeHandle;
use crate::storage::read_and_parse;

pub const MAP_TYPE: &str = "map";

const HEADER: &str = "header";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MapOp {
    Set { key: String, value: Value },
    Delete { key: String },
    Clear,
}

pub struct MapChannel {
    address: String,
    handle: RuntimeHandle,
    data: BTreeMap<String, Value>,
    /// Highest client sequence number applied per sender
    applied: HashMap<ClientId, u64>,
    minimum_sequence_number: u64,
    stopped: bool,
}

impl MapChannel {
    fn new(services: &ChannelServices, data: BTreeMap<String, Value>) -> Self {
        Self {
            address: services.address.clone(),
            handle: services.handle.clone(),
            data,
            applied: HashMap::new(),
            minimum_sequence_number: services.minimum_sequence_number,
            stopped: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn minimum_sequence_number(&self) -> u64 {
        self.minimum_sequence_number
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), ChannelError> {
        self.submit(MapOp::Set {
            key: key.into(),
            value,
        })
    }

    pub fn delete(&self, key: impl Into<String>) -> Result<(), ChannelError> {
        self.submit(MapOp::Delete { key: key.into() })
    }

    pub fn clear(&self) -> Result<(), ChannelError> {
        self.submit(MapOp::Clear)
    }

    fn submit(&self, op: MapOp) -> Result<(), ChannelError> {
        if self.stopped {
            return Err(ChannelError::Stopped(self.address.clone()));
        }
        let contents = serde_json::to_value(&op)?;
        self.handle
            .submit(MessageContents::operation(self.address.clone(), contents))?;
        Ok(())
    }

    fn apply(&mut self, op: MapOp) {
        match op {
            MapOp::Set { key, value } => {
                self.data.insert(key, value);
            }
            MapOp::Delete { key } => {
                self.data.remove(&key);
            }
            MapOp::Clear => self.data.clear(),
        }
    }
}

impl Channel for MapChannel {
    fn process(
        &mut self,
        message: &SequencedMessage,
        _local: bool,
        _context: Option<Value>,
    ) -> Result<(), ChannelError> {
        let MessageContents::Operation(envelope) = &message.contents else {
            return Ok(());
        };

        if let Some(client_id) = &message.client_id {
            let last = self.applied.entry(client_id.clone()).or_insert(0);
            if message.client_sequence_number != 0 && message.client_sequence_number <= *last {
                log::debug!(
                    "{}: skipping replayed op {}:{}",
                    self.address,
                    client_id,
                    message.client_sequence_number
                );
                return Ok(());
            }
            *last = message.client_sequence_number;
        }

        let op: MapOp = serde_json::from_value(envelope.contents.clone()).map_err(|e| {
            ChannelError::InvalidOperation {
                address: self.address.clone(),
                reason: e.to_string(),
            }
        })?;
        self.apply(op);
        Ok(())
    }

    fn snapshot(&self) -> Result<Tree, ChannelError> {
        let mut tree = Tree::new();
        tree.push(TreeEntry::blob(HEADER, Blob::json(&self.data)?));
        Ok(tree)
    }

    fn stop(&mut self) -> Result<Tree, ChannelError> {
        self.stopped = true;
        self.snapshot()
    }

    fn update_min_sequence_number(&mut self, minimum_sequence_number: u64) {
        self.minimum_sequence_number = minimum_sequence_number;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct MapFactory;

#[async_trait]
impl ChannelFactory for MapFactory {
    fn kind(&self) -> &str {
        MAP_TYPE
    }

    fn create(&self, services: ChannelServices) -> Result<Box<dyn Channel>, ChannelError> {
        Ok(Box::new(MapChannel::new(&services, BTreeMap::new())))
    }

    async fn load(
        &self,
        services: ChannelServices,
        tree: &SnapshotTree,
        _history: Vec<SequencedMessage>,
    ) -> Result<Box<dyn Channel>, ChannelError> {
        // The header already reflects every op up to the snapshot.
        let data = match tree.blob(HEADER) {
            Some(sha) => read_and_parse(services.storage.as_ref(), sha).await?,
            None => BTreeMap::new(),
        };
        Ok(Box::new(MapChannel::new(&services, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ConnectionState;
    use crate::handle::RuntimeRequest;
    use crate::storage::{MemoryStorage, RuntimeStorageService};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn services() -> (ChannelServices, mpsc::UnboundedReceiver<RuntimeRequest>) {
        let (handle, rx) = RuntimeHandle::channel();
        let services = ChannelServices {
            address: "root".into(),
            document_id: "doc".into(),
            branch: "doc".into(),
            storage: Arc::new(MemoryStorage::new("doc", "memory://doc")),
            handle,
            client_id: None,
            connection_state: ConnectionState::Disconnected,
            minimum_sequence_number: 0,
            existing: false,
        };
        (services, rx)
    }

    fn sequenced(seq: u64, client: &str, csn: u64, op: MapOp) -> SequencedMessage {
        SequencedMessage {
            sequence_number: seq,
            minimum_sequence_number: 0,
            client_id: Some(client.into()),
            client_sequence_number: csn,
            reference_sequence_number: seq - 1,
            origin: None,
            timestamp: 0,
            contents: MessageContents::operation("root", serde_json::to_value(op).unwrap()),
        }
    }

    fn set(key: &str, value: Value) -> MapOp {
        MapOp::Set {
            key: key.into(),
            value,
        }
    }

    #[test]
    fn test_last_sequenced_write_wins() {
        let (services, _rx) = services();
        let mut map = MapFactory.create(services).unwrap();

        map.process(&sequenced(1, "a", 1, set("k", json!(1))), false, None).unwrap();
        map.process(&sequenced(2, "b", 1, set("k", json!(2))), false, None).unwrap();
        map.process(&sequenced(3, "a", 2, set("other", json!(true))), true, None).unwrap();

        let map = map.as_any().downcast_ref::<MapChannel>().unwrap();
        assert_eq!(map.get("k"), Some(&json!(2)));
        assert_eq!(map.keys(), vec!["k".to_string(), "other".to_string()]);
    }

    #[test]
    fn test_replayed_client_sequence_is_ignored() {
        let (services, _rx) = services();
        let mut map = MapFactory.create(services).unwrap();

        map.process(&sequenced(1, "a", 1, set("k", json!("first"))), false, None).unwrap();
        map.process(&sequenced(2, "a", 2, MapOp::Delete { key: "k".into() }), false, None)
            .unwrap();
        map.process(&sequenced(3, "a", 1, set("k", json!("first"))), false, None).unwrap();

        let map = map.as_any().downcast_ref::<MapChannel>().unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_malformed_op_is_rejected() {
        let (services, _rx) = services();
        let mut map = MapFactory.create(services).unwrap();
        let mut message = sequenced(1, "a", 1, MapOp::Clear);
        message.contents = MessageContents::operation("root", json!({"type": "explode"}));

        assert!(matches!(
            map.process(&message, false, None),
            Err(ChannelError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_set_submits_through_handle() {
        let (services, mut rx) = services();
        let map = MapFactory.create(services).unwrap();
        let map = map.as_any().downcast_ref::<MapChannel>().unwrap();
        map.set("k", json!(5)).unwrap();

        match rx.try_recv().unwrap() {
            RuntimeRequest::Submit(MessageContents::Operation(envelope)) => {
                assert_eq!(envelope.address, "root");
                assert_eq!(envelope.contents, json!({"type": "set", "key": "k", "value": 5}));
            }
            other => panic!("unexpected request {other:?}"),
        }
        assert!(map.is_empty(), "not applied until sequenced");
    }

    #[test]
    fn test_stopped_map_refuses_writes() {
        let (services, _rx) = services();
        let mut map = MapFactory.create(services).unwrap();
        map.stop().unwrap();
        let map = map.as_any().downcast_ref::<MapChannel>().unwrap();
        assert!(matches!(map.set("k", json!(1)), Err(ChannelError::Stopped(_))));
    }

    #[tokio::test]
    async fn test_snapshot_then_load() {
        let (services, _rx) = services();
        let mut map = MapFactory.create(services.clone()).unwrap();
        map.process(&sequenced(1, "a", 1, set("k", json!({"nested": [1, 2]}))), false, None)
            .unwrap();

        let mut blobs = std::collections::HashMap::new();
        let tree = map.snapshot().unwrap().to_snapshot_tree(&mut blobs).unwrap();
        let mut services = services;
        services.storage = Arc::new(RuntimeStorageService::new(services.storage.clone(), blobs));

        let loaded = MapFactory.load(services, &tree, Vec::new()).await.unwrap();
        let loaded = loaded.as_any().downcast_ref::<MapChannel>().unwrap();
        assert_eq!(loaded.get("k"), Some(&json!({"nested": [1, 2]})));
    }
}
