//! Assembling a document.
//!
//! ```text
//! storage ─► version ─► snapshot tree ─► .attributes
//!                                           │
//!        ┌──────────────┬───────────────┬───┴────────────┬──────────────┐
//!        ▼              ▼               ▼                ▼              ▼
//!  delta stream   quorum ─► code    .blobs        .messages      channel commits
//!        │              │               │                │              │
//!        └──────────────┴───────────────┴───────┬────────┴──────────────┘
//!                                               ▼
//!                              components ─► resume inbound/outbound
//! ```
//!
//! Independent steps run concurrently; the first failure fails the load.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use futures_util::future::try_join_all;
use quill_core::{
    BlobMetadata, DocumentAttributes, MessageContents, Origin, QuorumSnapshot, SequencedMessage,
    SnapshotTree, User, Version,
};

use super::snapshot::{ATTRIBUTES_BLOB, BLOBS_BLOB, MESSAGES_BLOB, QUORUM_BLOB};
use super::{Component, ConnectionState, Document};
use crate::blob::BlobManager;
use crate::chunk::{ChunkReassembler, UnackedChunks};
use crate::code::CodeLoader;
use crate::delta::DeltaManager;
use crate::error::DocumentError;
use crate::events::Listeners;
use crate::handle::RuntimeHandle;
use crate::options::DocumentOptions;
use crate::quorum::Quorum;
use crate::service::{DocumentService, StaticTokenProvider, TokenProvider};
use crate::storage::{read_and_parse, DocumentStorageService, StorageError};

/// Everything needed to load a document.
pub struct LoadRequest {
    pub id: String,
    pub tenant_id: String,
    pub user: User,
    pub token_provider: Arc<dyn TokenProvider>,
    pub service: Arc<dyn DocumentService>,
    pub code_loader: Arc<dyn CodeLoader>,
    pub options: DocumentOptions,
    /// Load this version instead of the latest one
    pub specified_version: Option<Version>,
    /// Open the delta stream; without it the document is a read-only view
    pub connect: bool,
}

impl LoadRequest {
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        user: User,
        service: Arc<dyn DocumentService>,
        code_loader: Arc<dyn CodeLoader>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            user,
            token_provider: Arc::new(StaticTokenProvider::anonymous()),
            service,
            code_loader,
            options: DocumentOptions::default(),
            specified_version: None,
            connect: true,
        }
    }

    pub fn with_options(mut self, options: DocumentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.specified_version = Some(version);
        self
    }

    pub fn with_token_provider(mut self, token_provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = token_provider;
        self
    }

    pub fn without_connection(mut self) -> Self {
        self.connect = false;
        self
    }
}

type TardisMessages = (HashMap<String, Vec<SequencedMessage>>, Vec<SequencedMessage>);

impl Document {
    /// Load a document from its latest (or the requested) snapshot and,
    /// unless disabled, connect it to the ordering service.
    pub async fn load(request: LoadRequest) -> Result<Self, DocumentError> {
        let LoadRequest {
            id,
            tenant_id,
            user,
            token_provider,
            service,
            code_loader,
            mut options,
            specified_version,
            connect,
        } = request;
        if options.client.user.is_none() {
            options.client.user = Some(user.clone());
        }
        log::info!("{}: loading (connect: {})", id, connect);

        let storage = service
            .connect_to_storage(&tenant_id, &id, token_provider.as_ref())
            .await?;
        let delta_storage = service
            .connect_to_delta_storage(&tenant_id, &id, token_provider.as_ref())
            .await?;

        let version = match specified_version {
            Some(version) => Some(version),
            None => storage.get_versions(&id, 1).await?.into_iter().next(),
        };
        let tree = match &version {
            Some(version) => Some(storage.get_snapshot_tree(version).await?),
            None => None,
        };
        let attributes = load_attributes(storage.as_ref(), tree.as_ref(), &id).await?;
        attributes.validate()?;

        let (handle, requests) = RuntimeHandle::channel();
        let mut delta_manager = DeltaManager::new(
            id.clone(),
            tenant_id.clone(),
            service,
            token_provider,
            delta_storage,
            &options,
        );
        delta_manager.set_minimum_sequence_number(attributes.minimum_sequence_number);

        let connect_task = async {
            let details = if connect {
                Some(delta_manager.connect("document loading").await?)
            } else {
                None
            };
            Ok::<_, DocumentError>(details)
        };
        let code_task = async {
            let quorum =
                load_quorum(storage.as_ref(), tree.as_ref(), &attributes, handle.clone()).await?;
            let chaincode = super::runtime::load_code_from_quorum(
                code_loader.as_ref(),
                &quorum,
                tree.as_ref(),
                &options,
            )
            .await?;
            Ok::<_, DocumentError>((quorum, chaincode))
        };
        let (details, (quorum, chaincode), blob_manager, tardis, submodules) = futures_util::try_join!(
            connect_task,
            code_task,
            load_blob_manager(storage.clone(), tree.as_ref()),
            load_tardis_messages(storage.as_ref(), tree.as_ref(), &attributes, &id),
            load_submodules(storage.as_ref(), tree.as_ref()),
        )?;

        if connect {
            delta_manager
                .attach_op_handler(attributes.sequence_number)
                .await?;
        }

        let (existing, parent_branch) = match (&version, &details) {
            (Some(_), _) => (true, (attributes.branch != id).then(|| attributes.branch.clone())),
            (None, Some(details)) => (details.existing, details.parent_branch.clone()),
            (None, None) => (false, None),
        };
        let (mut history, window) = tardis;

        let mut document = Document {
            id,
            tenant_id,
            user,
            options,
            code_loader,
            storage,
            delta_manager,
            quorum,
            blob_manager,
            components: BTreeMap::new(),
            chaincode,
            chunks: ChunkReassembler::from_partial_ops(attributes.partial_ops),
            unacked_chunks: UnackedChunks::new(),
            messages_since_msn_change: VecDeque::from(window),
            connection_state: ConnectionState::Disconnected,
            pending_client_id: None,
            client_id: None,
            existing,
            parent_branch,
            last_version: version.map(|v| v.sha),
            loaded: false,
            closed: false,
            listeners: Listeners::new(),
            handle,
            requests,
            pending_transition: None,
            failed_transition: None,
        };

        let loads = submodules.iter().map(|(address, tree)| {
            let services = document.channel_services(address, document.storage.clone());
            Component::load(
                tree,
                &document.chaincode,
                services,
                history.remove(address).unwrap_or_default(),
            )
        });
        let components = try_join_all(loads).await?;
        for component in components {
            document
                .components
                .insert(component.address().to_string(), component);
        }

        if let Some(details) = details {
            document.set_connection_state(
                ConnectionState::Connecting,
                "websocket established",
                Some(details.client_id),
            );
        }
        document.loaded = true;

        let state = document.connection_state;
        let client_id = document.client_id.clone();
        for component in document.components.values_mut() {
            component.change_connection_state(state, client_id.as_deref());
        }

        if connect {
            document.delta_manager.resume_inbound();
            document.delta_manager.resume_outbound()?;
        }
        log::info!(
            "{}: loaded {} channels (existing: {}, package: {:?})",
            document.id,
            document.components.len(),
            document.existing,
            document.package()
        );
        Ok(document)
    }
}

// ─── Load steps ─────────────────────────────────────────────

async fn load_attributes(
    storage: &dyn DocumentStorageService,
    tree: Option<&SnapshotTree>,
    id: &str,
) -> Result<DocumentAttributes, DocumentError> {
    let Some(tree) = tree else {
        return Ok(DocumentAttributes::new_document(id));
    };
    let sha = tree
        .blob(ATTRIBUTES_BLOB)
        .ok_or_else(|| DocumentError::MissingBlob(ATTRIBUTES_BLOB.to_string()))?;
    Ok(read_and_parse(storage, sha).await?)
}

async fn load_quorum(
    storage: &dyn DocumentStorageService,
    tree: Option<&SnapshotTree>,
    attributes: &DocumentAttributes,
    handle: RuntimeHandle,
) -> Result<Quorum, DocumentError> {
    let snapshot = match tree.and_then(|t| t.blob(QUORUM_BLOB)) {
        Some(sha) => read_and_parse(storage, sha).await?,
        None => QuorumSnapshot {
            members: attributes.clients.clone(),
            proposals: attributes.proposals.clone(),
            values: attributes.values.clone(),
        },
    };
    Ok(Quorum::from_snapshot(
        attributes.minimum_sequence_number,
        snapshot,
        Some(handle),
    ))
}

async fn load_blob_manager(
    storage: Arc<dyn DocumentStorageService>,
    tree: Option<&SnapshotTree>,
) -> Result<BlobManager, DocumentError> {
    let blobs: Vec<BlobMetadata> = match tree.and_then(|t| t.blob(BLOBS_BLOB)) {
        Some(sha) => read_and_parse(storage.as_ref(), sha).await?,
        None => Vec::new(),
    };
    let mut manager = BlobManager::new(storage);
    manager.load_blob_metadata(blobs);
    Ok(manager)
}

/// Ops above the snapshot's MSN, grouped by channel address, plus the full
/// list in sequence order. Ops replayed from a parent branch get an origin.
async fn load_tardis_messages(
    storage: &dyn DocumentStorageService,
    tree: Option<&SnapshotTree>,
    attributes: &DocumentAttributes,
    id: &str,
) -> Result<TardisMessages, DocumentError> {
    let mut messages: Vec<SequencedMessage> = match tree.and_then(|t| t.blob(MESSAGES_BLOB)) {
        Some(sha) => read_and_parse(storage, sha).await?,
        None => Vec::new(),
    };

    if attributes.branch != id {
        for message in &mut messages {
            message.origin = Some(Origin {
                id: attributes.branch.clone(),
                minimum_sequence_number: message.minimum_sequence_number,
                sequence_number: message.sequence_number,
            });
        }
    }

    let mut by_address: HashMap<String, Vec<SequencedMessage>> = HashMap::new();
    for message in &messages {
        if let MessageContents::Operation(envelope) = &message.contents {
            by_address
                .entry(envelope.address.clone())
                .or_default()
                .push(message.clone());
        }
    }
    Ok((by_address, messages))
}

/// Snapshot trees of every channel commit referenced from the root tree.
async fn load_submodules(
    storage: &dyn DocumentStorageService,
    tree: Option<&SnapshotTree>,
) -> Result<Vec<(String, SnapshotTree)>, DocumentError> {
    let Some(tree) = tree else {
        return Ok(Vec::new());
    };
    let loads = tree.commits.iter().map(|(address, sha)| async move {
        let version = storage
            .get_versions(sha, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound(sha.clone()))?;
        let subtree = storage.get_snapshot_tree(&version).await?;
        Ok::<_, DocumentError>((address.clone(), subtree))
    });
    try_join_all(loads).await
}
