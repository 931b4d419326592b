//! A [`DocumentService`] that keeps everything in the current process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use quill_core::{ClientDetail, SequencedMessage};
use tokio::sync::RwLock;

use super::orderer::LocalOrderer;
use crate::delta::{DeltaConnection, DeltaError, DeltaStorageService};
use crate::service::{DocumentService, TokenProvider};
use crate::storage::{DocumentStorageService, MemoryStorage, StorageError};

/// Configuration for [`LocalDocumentService`].
#[derive(Debug, Clone)]
pub struct LocalServiceConfig {
    /// Largest serialized payload accepted per message, in bytes
    pub max_message_size: usize,
    /// Base of the raw blob urls handed out by storage
    pub repository_url: String,
}

impl Default for LocalServiceConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024,
            repository_url: "memory://quill".to_string(),
        }
    }
}

impl LocalServiceConfig {
    /// Small message limit so chunking kicks in with modest payloads.
    pub fn for_testing() -> Self {
        Self {
            max_message_size: 4096,
            ..Self::default()
        }
    }
}

struct LocalDocument {
    storage: Arc<MemoryStorage>,
    orderer: Arc<LocalOrderer>,
}

/// Document service backed by [`MemoryStorage`] and a [`LocalOrderer`] per
/// document. Documents are created on first use.
pub struct LocalDocumentService {
    config: LocalServiceConfig,
    documents: RwLock<HashMap<(String, String), Arc<LocalDocument>>>,
}

impl LocalDocumentService {
    pub fn new(config: LocalServiceConfig) -> Self {
        Self {
            config,
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LocalServiceConfig {
        &self.config
    }

    async fn get_or_create(&self, tenant_id: &str, id: &str) -> Arc<LocalDocument> {
        let key = (tenant_id.to_string(), id.to_string());
        {
            let documents = self.documents.read().await;
            if let Some(document) = documents.get(&key) {
                return document.clone();
            }
        }

        let mut documents = self.documents.write().await;
        if let Some(document) = documents.get(&key) {
            return document.clone();
        }
        log::debug!("creating local document {}/{}", tenant_id, id);
        let repository_url = format!("{}/{}/{}", self.config.repository_url, tenant_id, id);
        let document = Arc::new(LocalDocument {
            storage: Arc::new(MemoryStorage::new(id, repository_url)),
            orderer: Arc::new(LocalOrderer::new(id, self.config.max_message_size)),
        });
        documents.insert(key, document.clone());
        document
    }

    /// The orderer sequencing `tenant_id/id`.
    pub async fn orderer(&self, tenant_id: &str, id: &str) -> Arc<LocalOrderer> {
        self.get_or_create(tenant_id, id).await.orderer.clone()
    }

    /// The snapshot store of `tenant_id/id`.
    pub async fn storage(&self, tenant_id: &str, id: &str) -> Arc<MemoryStorage> {
        self.get_or_create(tenant_id, id).await.storage.clone()
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

impl Default for LocalDocumentService {
    fn default() -> Self {
        Self::new(LocalServiceConfig::default())
    }
}

#[async_trait]
impl DocumentService for LocalDocumentService {
    async fn connect_to_storage(
        &self,
        tenant_id: &str,
        id: &str,
        _tokens: &dyn TokenProvider,
    ) -> Result<Arc<dyn DocumentStorageService>, StorageError> {
        Ok(self.storage(tenant_id, id).await)
    }

    async fn connect_to_delta_storage(
        &self,
        tenant_id: &str,
        id: &str,
        _tokens: &dyn TokenProvider,
    ) -> Result<Arc<dyn DeltaStorageService>, DeltaError> {
        let orderer = self.orderer(tenant_id, id).await;
        Ok(Arc::new(LocalDeltaStorage { orderer }))
    }

    async fn connect_to_delta_stream(
        &self,
        tenant_id: &str,
        id: &str,
        tokens: &dyn TokenProvider,
        client: &ClientDetail,
    ) -> Result<Box<dyn DeltaConnection>, DeltaError> {
        if tokens.token().is_none() {
            log::debug!("{}/{}: anonymous connection", tenant_id, id);
        }
        let document = self.get_or_create(tenant_id, id).await;
        let existing = document.storage.resolve_ref("").is_some();
        Ok(Box::new(document.orderer.connect(client, existing)))
    }
}

/// Delta storage reads served straight from an orderer's log.
pub struct LocalDeltaStorage {
    orderer: Arc<LocalOrderer>,
}

#[async_trait]
impl DeltaStorageService for LocalDeltaStorage {
    async fn get(&self, from: u64, to: Option<u64>) -> Result<Vec<SequencedMessage>, DeltaError> {
        Ok(self.orderer.get(from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::StaticTokenProvider;

    #[tokio::test]
    async fn test_documents_are_shared_per_key() {
        let service = LocalDocumentService::default();
        let a = service.orderer("t", "doc").await;
        let b = service.orderer("t", "doc").await;
        assert!(Arc::ptr_eq(&a, &b));

        service.orderer("t", "other").await;
        service.orderer("u", "doc").await;
        assert_eq!(service.document_count().await, 3);
    }

    #[tokio::test]
    async fn test_delta_storage_reads_orderer_log() {
        let service = LocalDocumentService::new(LocalServiceConfig::for_testing());
        let tokens = StaticTokenProvider::anonymous();

        let mut connection = service
            .connect_to_delta_stream("t", "doc", &tokens, &ClientDetail::default())
            .await
            .unwrap();
        assert!(!connection.details().existing);
        assert_eq!(connection.details().max_message_size, 4096);

        let deltas = service
            .connect_to_delta_storage("t", "doc", &tokens)
            .await
            .unwrap();
        assert_eq!(deltas.get(0, None).await.unwrap().len(), 1);

        connection.close();
        assert_eq!(deltas.get(0, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_storage_url_is_scoped_to_document() {
        let service = LocalDocumentService::default();
        let storage = service
            .connect_to_storage("t", "doc", &StaticTokenProvider::new("secret"))
            .await
            .unwrap();
        assert_eq!(storage.repository_url(), "memory://quill/t/doc");
    }
}
