//! Service contracts for reaching a document's storage and ordering service.

use std::sync::Arc;

use async_trait::async_trait;
use quill_core::ClientDetail;

use crate::delta::{DeltaConnection, DeltaError, DeltaStorageService};
use crate::storage::{DocumentStorageService, StorageError};

/// Supplies the access token presented to services.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A fixed token, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }
}

/// Entry point to the services backing a document.
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn connect_to_storage(
        &self,
        tenant_id: &str,
        id: &str,
        tokens: &dyn TokenProvider,
    ) -> Result<Arc<dyn DocumentStorageService>, StorageError>;

    async fn connect_to_delta_storage(
        &self,
        tenant_id: &str,
        id: &str,
        tokens: &dyn TokenProvider,
    ) -> Result<Arc<dyn DeltaStorageService>, DeltaError>;

    /// Open a live delta stream. The service sequences a `clientJoin` for
    /// the new client as part of the handshake.
    async fn connect_to_delta_stream(
        &self,
        tenant_id: &str,
        id: &str,
        tokens: &dyn TokenProvider,
        client: &ClientDetail,
    ) -> Result<Box<dyn DeltaConnection>, DeltaError>;
}
