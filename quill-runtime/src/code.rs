//! Code packages: the channel types a document can host.
//!
//! The quorum agrees on a `code` value naming a package. A [`CodeLoader`]
//! resolves the name to a [`CodeModule`], which instantiates a
//! [`Chaincode`]: a registry of [`ChannelFactory`] keyed by channel type.
//!
//! ```text
//! quorum["code"] = "pkg" ──► CodeLoader::load ──► CodeModule::instantiate
//!                                                        │
//!                                   Chaincode { "map" ─► MapFactory,
//!                                               "text" ─► TextFactory }
//! ```

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use quill_core::{ClientId, SequencedMessage, SnapshotTree, Tree, TreeError};
use serde_json::Value;
use thiserror::Error;

use crate::document::ConnectionState;
use crate::handle::RuntimeHandle;
use crate::storage::{DocumentStorageService, StorageError};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid operation on {address}: {reason}")]
    InvalidOperation { address: String, reason: String },

    #[error("channel {0} is stopped")]
    Stopped(String),

    #[error("crdt update rejected: {0}")]
    Crdt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    RuntimeClosed(#[from] crate::handle::RuntimeClosed),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("unknown code package {0}")]
    UnknownPackage(String),

    #[error("package {package} has no channel type {kind}")]
    UnknownChannelType { package: String, kind: String },

    #[error("package {package} failed to instantiate: {reason}")]
    Instantiate { package: String, reason: String },
}

/// Context handed to a channel when it is created or loaded.
#[derive(Clone)]
pub struct ChannelServices {
    pub address: String,
    pub document_id: String,
    pub branch: String,
    pub storage: Arc<dyn DocumentStorageService>,
    pub handle: RuntimeHandle,
    pub client_id: Option<ClientId>,
    pub connection_state: ConnectionState,
    pub minimum_sequence_number: u64,
    /// The document existed before this load
    pub existing: bool,
}

/// A distributed data structure living at one address in the document.
///
/// Every method is invoked from the document's processing loop, one message
/// at a time.
pub trait Channel: Send {
    /// First pass over an inbound op. The returned context is passed back to
    /// [`process`](Self::process).
    fn prepare(
        &mut self,
        _message: &SequencedMessage,
        _local: bool,
    ) -> Result<Option<Value>, ChannelError> {
        Ok(None)
    }

    fn process(
        &mut self,
        message: &SequencedMessage,
        local: bool,
        context: Option<Value>,
    ) -> Result<(), ChannelError>;

    /// Current state as a tree.
    fn snapshot(&self) -> Result<Tree, ChannelError>;

    /// Rewrite an op so it applies against the state at `sequence_number`.
    fn transform(&self, _message: &mut SequencedMessage, _sequence_number: u64) {}

    /// Stop accepting ops and hand back final state.
    fn stop(&mut self) -> Result<Tree, ChannelError> {
        self.snapshot()
    }

    fn change_connection_state(&mut self, _state: ConnectionState, _client_id: Option<&str>) {}

    fn update_min_sequence_number(&mut self, _minimum_sequence_number: u64) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Creates channels of one type.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    fn kind(&self) -> &str;

    /// A new, empty channel.
    fn create(&self, services: ChannelServices) -> Result<Box<dyn Channel>, ChannelError>;

    /// Rebuild a channel from its snapshot tree. `history` holds ops for
    /// this address that were sequenced after the snapshot's MSN.
    async fn load(
        &self,
        services: ChannelServices,
        tree: &SnapshotTree,
        history: Vec<SequencedMessage>,
    ) -> Result<Box<dyn Channel>, ChannelError>;
}

/// Instantiated code package.
#[derive(Clone, Default)]
pub struct Chaincode {
    package: Option<String>,
    factories: BTreeMap<String, Arc<dyn ChannelFactory>>,
}

impl Chaincode {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: Some(package.into()),
            factories: BTreeMap::new(),
        }
    }

    /// Runtime without any channel types, used before a package is agreed.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn with_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn register(&mut self, factory: Arc<dyn ChannelFactory>) {
        self.factories.insert(factory.kind().to_string(), factory);
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn factory(&self, kind: &str) -> Result<Arc<dyn ChannelFactory>, CodeError> {
        self.factories
            .get(kind)
            .cloned()
            .ok_or_else(|| CodeError::UnknownChannelType {
                package: self.package.clone().unwrap_or_else(|| "<null>".into()),
                kind: kind.to_string(),
            })
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for Chaincode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chaincode")
            .field("package", &self.package)
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[async_trait]
pub trait CodeModule: Send + Sync {
    async fn instantiate(&self) -> Result<Chaincode, CodeError>;
}

#[async_trait]
pub trait CodeLoader: Send + Sync {
    async fn load(&self, package: &str) -> Result<Arc<dyn CodeModule>, CodeError>;
}

/// Module that hands out clones of a prebuilt [`Chaincode`].
pub struct PrebuiltModule {
    chaincode: Chaincode,
}

impl PrebuiltModule {
    pub fn new(chaincode: Chaincode) -> Self {
        Self { chaincode }
    }
}

#[async_trait]
impl CodeModule for PrebuiltModule {
    async fn instantiate(&self) -> Result<Chaincode, CodeError> {
        Ok(self.chaincode.clone())
    }
}

/// Loader over a fixed set of registered packages.
#[derive(Default)]
pub struct StaticCodeLoader {
    modules: HashMap<String, Arc<dyn CodeModule>>,
}

impl StaticCodeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, package: impl Into<String>, module: Arc<dyn CodeModule>) {
        self.modules.insert(package.into(), module);
    }

    pub fn with_module(mut self, package: impl Into<String>, module: Arc<dyn CodeModule>) -> Self {
        self.register(package, module);
        self
    }
}

#[async_trait]
impl CodeLoader for StaticCodeLoader {
    async fn load(&self, package: &str) -> Result<Arc<dyn CodeModule>, CodeError> {
        self.modules
            .get(package)
            .cloned()
            .ok_or_else(|| CodeError::UnknownPackage(package.to_string()))
    }
}

/// Resolve and instantiate a package.
pub async fn load_code(loader: &dyn CodeLoader, package: &str) -> Result<Chaincode, CodeError> {
    log::info!("loading code package {}", package);
    let module = loader.load(package).await?;
    module.instantiate().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::standard_chaincode;

    #[tokio::test]
    async fn test_static_loader_resolves_registered_package() {
        let loader = StaticCodeLoader::new().with_module(
            "pkg",
            Arc::new(PrebuiltModule::new(standard_chaincode("pkg"))),
        );

        let chaincode = load_code(&loader, "pkg").await.unwrap();
        assert_eq!(chaincode.package(), Some("pkg"));
        assert_eq!(chaincode.kinds(), vec!["map", "text"]);
        assert!(chaincode.factory("map").is_ok());
    }

    #[tokio::test]
    async fn test_unknown_package() {
        let loader = StaticCodeLoader::new();
        assert_eq!(
            load_code(&loader, "missing").await.unwrap_err(),
            CodeError::UnknownPackage("missing".into())
        );
    }

    #[test]
    fn test_null_chaincode_has_no_channel_types() {
        let chaincode = Chaincode::null();
        assert!(chaincode.package().is_none());
        assert!(matches!(
            chaincode.factory("map"),
            Err(CodeError::UnknownChannelType { .. })
        ));
    }
}
