mod document_processing;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::ServiceResult;
use crate::pipeline::{
    Coordinator, EntityExtractor, FilePageReader, PageReader, RecordStore, StageExecutor,
};

/// Main service: document records plus the pipeline that processes them
pub struct FolioService {
    pub config: Arc<AppConfig>,
    pub db: Arc<Database>,
    pub coordinator: Arc<Coordinator>,
    entities: Arc<EntityExtractor>,
}

impl FolioService {
    /// Create a new service instance over an opened database
    pub async fn new(db: Arc<Database>, config: Arc<AppConfig>) -> ServiceResult<Self> {
        Self::with_reader(db, config, Arc::new(FilePageReader)).await
    }

    pub async fn with_reader(
        db: Arc<Database>,
        config: Arc<AppConfig>,
        reader: Arc<dyn PageReader>,
    ) -> ServiceResult<Self> {
        info!("Initializing Folio service");

        let entities = Arc::new(EntityExtractor::from_config(&config.entities)?);
        if let EntityExtractor::Ollama(client) = entities.as_ref() {
            if client.health_check().await {
                info!(url = %config.entities.ollama_url, "Ollama is available");
            } else {
                warn!(url = %config.entities.ollama_url, "Ollama is not available");
            }
        }

        let executor = StageExecutor::new(
            reader,
            Arc::clone(&entities),
            config.pipeline.text_workers,
            config.pipeline.entity_workers,
            config.pipeline.chunk_timeout(),
        );
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&db) as Arc<dyn RecordStore>,
            executor,
            &config.pipeline,
        ));
        info!(
            backend = entities.backend_name(),
            chunk_size = config.pipeline.chunk_size,
            "Pipeline ready"
        );

        Ok(Self {
            config,
            db,
            coordinator,
            entities,
        })
    }

    /// Name of the configured entity backend and whether it is reachable
    pub async fn entity_backend_status(&self) -> (&'static str, bool) {
        let available = match self.entities.as_ref() {
            EntityExtractor::Heuristic => true,
            EntityExtractor::Ollama(client) => client.health_check().await,
        };
        (self.entities.backend_name(), available)
    }
}
