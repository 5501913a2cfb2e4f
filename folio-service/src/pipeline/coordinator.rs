//! Drives one document through planning, dispatch and aggregation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{ServiceError, ServiceResult, format_error_chain_ref};

use super::aggregator::{combine, persist};
use super::dispatcher::FanOutDispatcher;
use super::planner::plan;
use super::retry::RetryPolicy;
use super::stages::StageExecutor;
use super::state::PipelineState;
use super::RecordStore;
use super::types::{Chunk, ChunkResult, DocumentHandle, DocumentResult};

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
}

/// Entry point of the pipeline.
///
/// Holds at most one live run per document; starting a new run for a
/// document cancels the one already in flight.
pub struct Coordinator {
    store: Arc<dyn RecordStore>,
    executor: StageExecutor,
    dispatcher: FanOutDispatcher,
    persist_policy: RetryPolicy,
    chunk_size: usize,
    runs: Arc<DashMap<String, ActiveRun>>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn RecordStore>, executor: StageExecutor, config: &PipelineConfig) -> Self {
        Self {
            store,
            executor,
            dispatcher: FanOutDispatcher::from_config(config),
            persist_policy: RetryPolicy::for_persist(config),
            chunk_size: config.chunk_size,
            runs: Arc::new(DashMap::new()),
        }
    }

    /// Start a run and return once its chunks have been dispatched.
    ///
    /// Planning failures do not surface here; they fail the returned run.
    pub async fn start(&self, document: DocumentHandle) -> PipelineRun {
        let run_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let started = Instant::now();

        if let Some(previous) = self.runs.insert(
            document.id.clone(),
            ActiveRun {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
            },
        ) {
            info!(
                doc_id = %document.id,
                superseded_run = %previous.run_id,
                run_id = %run_id,
                "Cancelling earlier run of document"
            );
            previous.cancel.cancel();
        }

        let (state_tx, state_rx) = watch::channel(PipelineState::NotStarted);
        let tracker = Arc::new(RunTracker {
            document_id: document.id.clone(),
            run_id: run_id.clone(),
            state: state_tx,
            store: Arc::clone(&self.store),
            runs: Arc::clone(&self.runs),
        });

        tracker.advance(PipelineState::Planning, None);

        let task = match self.plan_document(&document).await {
            Ok(chunks) if chunks.is_empty() => self.finish_empty(&tracker, &cancel, started),
            Ok(chunks) => self.dispatch(&document, chunks, &tracker, &cancel, started),
            Err(e) => {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move { tracker.conclude(Err(e), started) })
            }
        };

        PipelineRun {
            run_id,
            document_id: document.id,
            state: state_rx,
            task,
        }
    }

    /// Cancel the live run of a document, if there is one
    pub fn cancel(&self, document_id: &str) -> bool {
        match self.runs.get(document_id) {
            Some(run) => {
                run.cancel.cancel();
                info!(doc_id = %document_id, run_id = %run.run_id, "Run cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel the live run of a document and detach it from the record, so
    /// nothing it does later is mirrored. Used before queueing a fresh run.
    pub fn supersede(&self, document_id: &str) -> bool {
        match self.runs.remove(document_id) {
            Some((_, run)) => {
                run.cancel.cancel();
                info!(doc_id = %document_id, run_id = %run.run_id, "Run superseded");
                true
            }
            None => false,
        }
    }

    async fn plan_document(&self, document: &DocumentHandle) -> ServiceResult<Vec<Chunk>> {
        let total_pages = self.executor.page_count(document).await?;
        let chunks = plan(i64::from(total_pages), self.chunk_size)?;
        info!(
            doc_id = %document.id,
            total_pages,
            chunk_size = self.chunk_size,
            chunks = chunks.len(),
            "Document planned"
        );
        Ok(chunks)
    }

    /// A document without pages completes with an empty result and no
    /// chunk work. A run cancelled while planning writes nothing.
    fn finish_empty(
        &self,
        tracker: &Arc<RunTracker>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> JoinHandle<ServiceResult<DocumentResult>> {
        let tracker = Arc::clone(tracker);
        let cancel = cancel.clone();
        let policy = self.persist_policy.clone();

        tokio::spawn(async move {
            let result = DocumentResult::default();
            let outcome = persist(
                tracker.store.as_ref(),
                &tracker.document_id,
                &tracker.run_id,
                &result,
                &policy,
                &cancel,
            )
            .await
            .map(|()| result);
            tracker.conclude(outcome, started)
        })
    }

    fn dispatch(
        &self,
        document: &DocumentHandle,
        chunks: Vec<Chunk>,
        tracker: &Arc<RunTracker>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> JoinHandle<ServiceResult<DocumentResult>> {
        let total = chunks.len();
        let progress = Arc::new(AtomicUsize::new(0));
        tracker.record_progress(0, total);

        let on_each = {
            let executor = self.executor.clone();
            let document = document.clone();
            let tracker = Arc::clone(tracker);
            move |chunk: Chunk| {
                let executor = executor.clone();
                let document = document.clone();
                let tracker = Arc::clone(&tracker);
                let progress = Arc::clone(&progress);
                async move {
                    let result = executor.run(&document, &chunk).await?;
                    let done = (progress.fetch_add(1, Ordering::SeqCst) + 1).min(total);
                    tracker.record_progress(done, total);
                    Ok::<_, ServiceError>(result)
                }
            }
        };

        let on_complete = {
            let tracker = Arc::clone(tracker);
            let cancel = cancel.clone();
            let policy = self.persist_policy.clone();
            move |results: Vec<ChunkResult>| async move {
                tracker.advance(PipelineState::Aggregating, None);
                let result = combine(results);
                persist(
                    tracker.store.as_ref(),
                    &tracker.document_id,
                    &tracker.run_id,
                    &result,
                    &policy,
                    &cancel,
                )
                .await?;
                Ok::<_, ServiceError>(result)
            }
        };

        tracker.advance(PipelineState::Dispatched, None);
        let job = self
            .dispatcher
            .dispatch(&document.id, cancel, chunks, on_each, on_complete);
        debug!(doc_id = %document.id, group_id = %job.group_id(), chunks = job.total(), "Run dispatched");

        let tracker = Arc::clone(tracker);
        tokio::spawn(async move {
            let outcome = job.wait().await;
            tracker.conclude(outcome, started)
        })
    }
}

/// Publishes state changes of one run and mirrors them to the record store
struct RunTracker {
    document_id: String,
    run_id: String,
    state: watch::Sender<PipelineState>,
    store: Arc<dyn RecordStore>,
    runs: Arc<DashMap<String, ActiveRun>>,
}

impl RunTracker {
    /// A superseded run must not touch the record any more
    fn is_current(&self) -> bool {
        self.runs
            .get(&self.document_id)
            .is_some_and(|active| active.run_id == self.run_id)
    }

    fn advance(&self, next: PipelineState, error: Option<&str>) -> bool {
        let moved = self
            .state
            .send_if_modified(|current| {
                if current.can_transition_to(next) {
                    *current = next;
                    true
                } else {
                    false
                }
            });
        if !moved {
            debug!(
                doc_id = %self.document_id,
                run_id = %self.run_id,
                from = self.state.borrow().as_ref(),
                to = next.as_ref(),
                "Ignoring illegal state transition"
            );
            return false;
        }

        info!(doc_id = %self.document_id, run_id = %self.run_id, state = next.as_ref(), "Pipeline state changed");

        if self.is_current() {
            if let Err(e) = self.store.record_state(&self.document_id, next, error) {
                warn!(
                    doc_id = %self.document_id,
                    error = %format_error_chain_ref(&e),
                    "Failed to mirror pipeline state"
                );
            }
        }
        true
    }

    /// Best-effort chunk progress on the record
    fn record_progress(&self, completed: usize, total: usize) {
        if !self.is_current() {
            return;
        }
        if let Err(e) = self.store.record_progress(&self.document_id, completed, total) {
            warn!(
                doc_id = %self.document_id,
                error = %format_error_chain_ref(&e),
                "Failed to record progress"
            );
        }
    }

    /// Move the run to its terminal state and release its registration
    fn conclude(
        &self,
        outcome: ServiceResult<DocumentResult>,
        started: Instant,
    ) -> ServiceResult<DocumentResult> {
        let label = match &outcome {
            Ok(_) => {
                self.advance(PipelineState::Completed, None);
                "completed"
            }
            Err(e) => {
                let message = format_error_chain_ref(e);
                if matches!(e, ServiceError::AggregationPersist { .. }) {
                    error!(doc_id = %self.document_id, run_id = %self.run_id, error = %message, "Result could not be persisted; re-trigger the document");
                } else {
                    warn!(doc_id = %self.document_id, run_id = %self.run_id, error = %message, "Pipeline run failed");
                }
                self.advance(PipelineState::Failed, Some(&message));
                if matches!(e, ServiceError::Cancelled { .. }) {
                    "cancelled"
                } else {
                    "failed"
                }
            }
        };

        metrics::counter!("folio_runs_total", "outcome" => label).increment(1);
        metrics::histogram!("folio_run_duration_seconds").record(started.elapsed().as_secs_f64());

        self.runs
            .remove_if(&self.document_id, |_, active| active.run_id == self.run_id);
        outcome
    }
}

/// Handle to a started pipeline run
pub struct PipelineRun {
    run_id: String,
    document_id: String,
    state: watch::Receiver<PipelineState>,
    task: JoinHandle<ServiceResult<DocumentResult>>,
}

impl PipelineRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Wait for the run to reach a terminal state
    pub async fn wait(self) -> ServiceResult<DocumentResult> {
        self.task.await.map_err(|e| ServiceError::Internal {
            message: format!("pipeline run task failed: {}", e),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ProcessingStatus;
    use crate::db::{Database, Document};
    use crate::pipeline::entities::EntityExtractor;
    use crate::pipeline::testing::{FlakyStore, StaticPageReader};
    use std::time::Duration;

    fn config(chunk_size: usize) -> PipelineConfig {
        PipelineConfig {
            chunk_size,
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            persist_attempts: 2,
            ..PipelineConfig::default()
        }
    }

    struct Harness {
        coordinator: Coordinator,
        store: Arc<FlakyStore>,
        reader: Arc<StaticPageReader>,
    }

    fn harness(reader: StaticPageReader, store: FlakyStore, chunk_size: usize) -> Harness {
        let reader = Arc::new(reader);
        let store = Arc::new(store);
        store
            .db
            .insert_document(&Document::new_pending(
                "doc-1".to_string(),
                "Field notes".to_string(),
                "/tmp/notes.txt".to_string(),
            ))
            .unwrap();

        let executor = StageExecutor::new(
            Arc::clone(&reader) as Arc<dyn crate::pipeline::PageReader>,
            Arc::new(EntityExtractor::Heuristic),
            2,
            2,
            Duration::from_secs(5),
        );
        let coordinator = Coordinator::new(
            Arc::clone(&store) as Arc<dyn RecordStore>,
            executor,
            &config(chunk_size),
        );
        Harness {
            coordinator,
            store,
            reader,
        }
    }

    fn store() -> FlakyStore {
        FlakyStore::new(Database::open_in_memory().unwrap())
    }

    fn handle() -> DocumentHandle {
        DocumentHandle::new("doc-1", "/tmp/notes.txt")
    }

    async fn process(h: &Harness) -> ServiceResult<DocumentResult> {
        h.coordinator.start(handle()).await.wait().await
    }

    #[tokio::test]
    async fn test_five_pages_in_chunks_of_two() {
        let reader = StaticPageReader::new(&["Alpha", "Bravo", "Charlie", "Delta", "Echo"])
            .delayed(1, Duration::from_millis(30));
        let h = harness(reader, store(), 2);

        let run = h.coordinator.start(handle()).await;
        let result = run.wait().await.unwrap();

        assert_eq!(
            result.text,
            "Alpha\n\nBravo\n\nCharlie\n\nDelta\n\nEcho"
        );
        assert_eq!(
            result.entities,
            vec!["Alpha", "Bravo", "Charlie", "Delta", "Echo"]
        );
        assert_eq!(h.reader.read_calls(), 3);
        assert_eq!(h.store.saves(), 1);

        let doc = h.store.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Completed);
        assert_eq!(doc.processing_phase.as_deref(), Some("completed"));
        assert_eq!(doc.extracted_text.as_deref(), Some(result.text.as_str()));
        assert_eq!(doc.chunks_completed, Some(3));
        assert_eq!(doc.chunks_total, Some(3));
        assert!(h.coordinator.runs.is_empty());
    }

    #[tokio::test]
    async fn test_empty_document_completes_without_chunks() {
        let h = harness(StaticPageReader::new(&[]), store(), 2);

        let run = h.coordinator.start(handle()).await;
        let result = run.wait().await.unwrap();

        assert_eq!(result, DocumentResult::default());
        assert_eq!(h.reader.count_calls(), 1);
        assert_eq!(h.reader.read_calls(), 0);
        assert_eq!(h.store.saves(), 1);
        let doc = h.store.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Completed);
        assert_eq!(doc.extracted_text.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_failing_chunk_persists_nothing() {
        let reader = StaticPageReader::new(&["A", "B", "C", "D", "E"]).failing_reads(3, u32::MAX);
        let h = harness(reader, store(), 2);

        let err = process(&h).await.unwrap_err();

        assert!(matches!(err, ServiceError::Extraction { .. }));
        assert_eq!(h.store.saves(), 0);

        let doc = h.store.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Failed);
        assert_eq!(doc.processing_phase.as_deref(), Some("failed"));
        assert!(doc.extracted_text.is_none());
        assert!(doc.processing_error.unwrap().contains("pages [3, 4]"));
    }

    #[tokio::test]
    async fn test_transient_chunk_failure_is_retried() {
        let reader = StaticPageReader::new(&["A", "B", "C"]).failing_reads(3, 1);
        let h = harness(reader, store(), 2);

        let result = process(&h).await.unwrap();

        assert_eq!(result.text, "A\n\nB\n\nC");
        assert_eq!(h.reader.read_calls(), 3);
        assert_eq!(h.store.saves(), 1);
    }

    #[tokio::test]
    async fn test_persist_exhaustion_fails_run() {
        let h = harness(StaticPageReader::new(&["A"]), store().failing_saves(10), 2);

        let err = process(&h).await.unwrap_err();

        assert!(matches!(err, ServiceError::AggregationPersist { attempts: 2, .. }));
        let doc = h.store.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Failed);
        assert_eq!(doc.processing_phase.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn test_rerun_overwrites_result() {
        let h = harness(StaticPageReader::new(&["Alice", "Bob"]), store(), 1);

        let first = process(&h).await.unwrap();
        let second = process(&h).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.store.saves(), 2);
        let doc = h.store.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.entities, Some(vec!["Alice".to_string(), "Bob".to_string()]));
    }

    #[tokio::test]
    async fn test_new_run_cancels_older_one() {
        let reader = StaticPageReader::new(&["A", "B"]).delayed(1, Duration::from_millis(200));
        let h = harness(reader, store(), 1);

        let older = h.coordinator.start(handle()).await;
        let newer = h.coordinator.start(handle()).await;

        let err = older.wait().await.unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled { .. }));

        let result = newer.wait().await.unwrap();
        assert_eq!(result.text, "A\n\nB");
        assert_eq!(h.store.saves(), 1);
        let doc = h.store.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn test_superseded_run_leaves_record_alone() {
        let reader = StaticPageReader::new(&["A", "B"]).delayed(1, Duration::from_millis(100));
        let h = harness(reader, store(), 1);

        let run = h.coordinator.start(handle()).await;
        assert!(h.coordinator.supersede("doc-1"));
        h.store.db.mark_document_pending("doc-1").unwrap();

        let err = run.wait().await.unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled { .. }));
        let doc = h.store.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_stops_run() {
        let reader = StaticPageReader::new(&["A", "B"]).delayed(1, Duration::from_millis(200));
        let h = harness(reader, store(), 1);

        let run = h.coordinator.start(handle()).await;
        assert_eq!(run.state(), PipelineState::Dispatched);
        assert!(h.coordinator.cancel("doc-1"));

        let err = run.wait().await.unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled { .. }));
        assert_eq!(h.store.saves(), 0);
        assert!(!h.coordinator.cancel("doc-1"));
    }

    #[tokio::test]
    async fn test_cancel_while_planning_writes_nothing() {
        let reader = StaticPageReader::new(&[]).slow_count(Duration::from_millis(100));
        let h = harness(reader, store(), 2);

        let (run, cancelled) = tokio::join!(h.coordinator.start(handle()), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            h.coordinator.cancel("doc-1")
        });
        assert!(cancelled);

        let err = run.wait().await.unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled { .. }));
        assert_eq!(h.store.saves(), 0);
        let doc = h.store.db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Failed);
        assert!(doc.extracted_text.is_none());
    }
}
