use std::sync::Arc;

use anyhow::Result;
use flume::Sender;

use crate::blob_store::{BlobStore, LocalBlobStore};
use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::database::ChatDatabase;
use crate::llm_client::{GenerationService, LlmClient};
use crate::supervision::SupervisionEvent;

pub struct BackendRuntime {
    pub config: AppConfig,
    pub chat: Arc<ChatService>,
    pub database: Option<Arc<ChatDatabase>>,
    pub blob_store: Option<Arc<LocalBlobStore>>,
}

pub struct BackendRuntimeBuilder {
    config: AppConfig,
    event_tx: Sender<SupervisionEvent>,
    generation_service: Option<Arc<dyn GenerationService>>,
    seed: Option<u64>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: AppConfig, event_tx: Sender<SupervisionEvent>) -> Self {
        Self {
            config,
            event_tx,
            generation_service: None,
            seed: None,
        }
    }

    /// Replaces the HTTP model client, e.g. with a scripted one.
    pub fn with_generation_service(mut self, service: Arc<dyn GenerationService>) -> Self {
        self.generation_service = Some(service);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;
        config.validate()?;

        let service = self.generation_service.unwrap_or_else(|| {
            tracing::info!("Generation service: {}", config.llm_api_url);
            Arc::new(LlmClient::new(
                config.llm_api_url.clone(),
                config.llm_api_key.clone(),
            ))
        });

        let database = match ChatDatabase::new(&config.database_path) {
            Ok(db) => Some(Arc::new(db)),
            Err(e) => {
                tracing::warn!("Failed to open chat database, conversations will not persist: {:#}", e);
                None
            }
        };

        let blob_store = match LocalBlobStore::new(&config.blob_dir, &config.public_base_url) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!("Failed to open blob store, uploads stay local: {:#}", e);
                None
            }
        };

        let mut chat = ChatService::new(config.clone(), service).with_events(self.event_tx);
        if let Some(db) = database.clone() {
            chat = chat.with_database(db);
        }
        if let Some(store) = blob_store.clone() {
            chat = chat.with_blob_store(store as Arc<dyn BlobStore>);
        }
        if let Some(seed) = self.seed {
            chat = chat.with_seed(seed);
        }

        tracing::info!(
            "Runtime ready: model={}, supervision={}",
            config.model,
            if config.supervision.enabled { "on" } else { "off" }
        );

        Ok(BackendRuntime {
            config,
            chat: Arc::new(chat),
            database,
            blob_store,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: AppConfig, event_tx: Sender<SupervisionEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::UserIdentity;

    #[tokio::test]
    async fn bootstrap_wires_database_and_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            database_path: dir.path().join("faust.db").to_string_lossy().into_owned(),
            blob_dir: dir.path().join("blobs").to_string_lossy().into_owned(),
            ..AppConfig::default()
        };
        let (tx, _rx) = flume::unbounded();

        let runtime = BackendRuntime::bootstrap(config, tx).unwrap();
        assert!(runtime.database.is_some());
        assert!(runtime.blob_store.is_some());

        let me = UserIdentity::logged_in("a@example.com");
        runtime.chat.new_conversation(&me).await.unwrap();
        let stored = runtime
            .database
            .as_ref()
            .unwrap()
            .load_user_document("a@example.com")
            .unwrap()
            .unwrap();
        assert_eq!(stored.conversations.len(), 2);
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut config = AppConfig::default();
        config.supervision.reviewer_count = 0;
        let (tx, _rx) = flume::unbounded();
        assert!(BackendRuntime::bootstrap(config, tx).is_err());
    }
}
