//! Per-chunk two-stage transform: page text, then entities.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};

use super::entities::EntityExtractor;
use super::reader::PageReader;
use super::types::{Chunk, ChunkResult, DocumentHandle, join_pages};

/// Runs a chunk through text extraction and entity extraction.
///
/// Each stage draws a permit from its own pool, so the two stages can be
/// sized independently. Cloning shares the pools.
///
/// `chunk_timeout` bounds the time a chunk spends working in its stages.
/// Time spent waiting for a stage permit is not counted.
#[derive(Clone)]
pub struct StageExecutor {
    reader: Arc<dyn PageReader>,
    entities: Arc<EntityExtractor>,
    text_pool: Arc<Semaphore>,
    entity_pool: Arc<Semaphore>,
    chunk_timeout: Duration,
}

impl StageExecutor {
    pub fn new(
        reader: Arc<dyn PageReader>,
        entities: Arc<EntityExtractor>,
        text_workers: usize,
        entity_workers: usize,
        chunk_timeout: Duration,
    ) -> Self {
        Self {
            reader,
            entities,
            text_pool: Arc::new(Semaphore::new(text_workers.max(1))),
            entity_pool: Arc::new(Semaphore::new(entity_workers.max(1))),
            chunk_timeout,
        }
    }

    /// Process one chunk. Nothing is persisted here.
    pub async fn run(&self, document: &DocumentHandle, chunk: &Chunk) -> ServiceResult<ChunkResult> {
        let (text, spent) = self.extract_text(document, chunk).await?;
        let remaining = self.chunk_timeout.saturating_sub(spent);
        let entities = self.extract_entities(document, chunk, &text, remaining).await?;

        Ok(ChunkResult {
            pages: chunk.pages.clone(),
            text,
            entities,
        })
    }

    /// Page count of a document, read off the async runtime
    pub async fn page_count(&self, document: &DocumentHandle) -> ServiceResult<u32> {
        let reader = Arc::clone(&self.reader);
        let doc = document.clone();
        tokio::task::spawn_blocking(move || reader.page_count(&doc))
            .await
            .map_err(|e| ServiceError::extraction(&[], format!("Page count task failed: {}", e)))?
    }

    fn timed_out(&self, chunk: &Chunk) -> ServiceError {
        ServiceError::ChunkTimeout {
            chunk_key: chunk.key(),
            timeout: self.chunk_timeout,
        }
    }

    /// Returns the joined text and the time spent reading
    async fn extract_text(
        &self,
        document: &DocumentHandle,
        chunk: &Chunk,
    ) -> ServiceResult<(String, Duration)> {
        let permit = Arc::clone(&self.text_pool)
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::Internal {
                message: "text stage pool closed".to_string(),
            })?;
        let started = Instant::now();

        let reader = Arc::clone(&self.reader);
        let doc = document.clone();
        let pages = chunk.pages.clone();
        // The permit is released when the read returns, even if this
        // attempt has already timed out.
        let read = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            reader.read_pages(&doc, &pages)
        });
        let page_texts = tokio::time::timeout(self.chunk_timeout, read)
            .await
            .map_err(|_| self.timed_out(chunk))?
            .map_err(|e| {
                ServiceError::extraction(
                    chunk.pages.as_slice(),
                    format!("Page reader task failed: {}", e),
                )
            })??;

        let spent = started.elapsed();
        let text = join_pages(page_texts.iter().map(|p| p.text.as_str()));
        metrics::histogram!("folio_stage_duration_seconds", "stage" => "text")
            .record(spent.as_secs_f64());
        debug!(
            doc_id = %document.id,
            chunk = chunk.key(),
            requested = chunk.pages.len(),
            read = page_texts.len(),
            chars = text.len(),
            "Text stage finished"
        );
        Ok((text, spent))
    }

    async fn extract_entities(
        &self,
        document: &DocumentHandle,
        chunk: &Chunk,
        text: &str,
        budget: Duration,
    ) -> ServiceResult<Vec<String>> {
        let _permit = self
            .entity_pool
            .acquire()
            .await
            .map_err(|_| ServiceError::Internal {
                message: "entity stage pool closed".to_string(),
            })?;
        let started = Instant::now();

        let entities = tokio::time::timeout(budget, self.entities.extract(text))
            .await
            .map_err(|_| self.timed_out(chunk))??;

        metrics::histogram!("folio_stage_duration_seconds", "stage" => "entities")
            .record(started.elapsed().as_secs_f64());
        debug!(
            doc_id = %document.id,
            chunk = chunk.key(),
            backend = self.entities.backend_name(),
            entities = entities.len(),
            "Entity stage finished"
        );
        Ok(entities)
    }
}
