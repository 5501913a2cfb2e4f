//! Fan-out of chunk invocations with a single group continuation.
//!
//! Every chunk runs as its own tokio task. A countdown of outstanding chunks
//! and a failure flag decide the group outcome: the task that takes the
//! countdown to zero runs the continuation, and the first permanent failure
//! cancels the rest of the group and reports through the [`JobHandle`].
//!
//! Invocations bound their own running time (see `StageExecutor`); a
//! `ChunkTimeout` they return is retried like any other transient failure.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{ServiceError, ServiceResult, format_error_chain_ref};

use super::retry::RetryPolicy;
use super::types::{Chunk, ChunkResult};

type Continuation<T> =
    Box<dyn FnOnce(Vec<ChunkResult>) -> BoxFuture<'static, ServiceResult<T>> + Send>;

/// Runs chunk invocations concurrently under a shared concurrency limit
pub struct FanOutDispatcher {
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl FanOutDispatcher {
    pub fn new(max_concurrent: usize, retry: RetryPolicy) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.max_concurrent_chunks, RetryPolicy::for_chunks(config))
    }

    /// Dispatch one invocation of `on_each` per chunk.
    ///
    /// `on_complete` receives every chunk result, in arrival order, once all
    /// invocations have succeeded. It never runs for a failed group.
    /// Cancelling `parent` cancels the group; `label` names the group in
    /// logs and in its cancellation error.
    pub fn dispatch<T, W, WF, C, CF>(
        &self,
        label: &str,
        parent: &CancellationToken,
        chunks: Vec<Chunk>,
        on_each: W,
        on_complete: C,
    ) -> JobHandle<T>
    where
        T: Send + 'static,
        W: Fn(Chunk) -> WF + Send + Sync + 'static,
        WF: Future<Output = ServiceResult<ChunkResult>> + Send + 'static,
        C: FnOnce(Vec<ChunkResult>) -> CF + Send + 'static,
        CF: Future<Output = ServiceResult<T>> + Send + 'static,
    {
        let total = chunks.len();
        let (tx, rx) = oneshot::channel();
        let continuation: Continuation<T> =
            Box::new(move |results: Vec<ChunkResult>| on_complete(results).boxed());

        let group = Arc::new(JobGroup {
            id: Uuid::new_v4(),
            label: label.to_string(),
            remaining: AtomicUsize::new(total),
            failed: AtomicBool::new(false),
            results: Mutex::new(Vec::with_capacity(total)),
            continuation: Mutex::new(Some(continuation)),
            outcome: Mutex::new(Some(tx)),
            cancel: parent.child_token(),
        });

        info!(group_id = %group.id, label, chunks = total, "Dispatching chunk group");

        if total == 0 {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.finish().await });
        }

        let on_each = Arc::new(on_each);
        for chunk in chunks {
            tokio::spawn(run_chunk(
                Arc::clone(&group),
                chunk,
                Arc::clone(&on_each),
                Arc::clone(&self.permits),
                self.retry.clone(),
            ));
        }

        JobHandle {
            group_id: group.id,
            total,
            outcome: rx,
        }
    }
}

/// Caller's view of a dispatched group
pub struct JobHandle<T> {
    group_id: Uuid,
    total: usize,
    outcome: oneshot::Receiver<ServiceResult<T>>,
}

impl<T> JobHandle<T> {
    pub fn group_id(&self) -> Uuid {
        self.group_id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Continuation output, or the error that failed the group
    pub async fn wait(self) -> ServiceResult<T> {
        self.outcome.await.unwrap_or_else(|_| {
            Err(ServiceError::Internal {
                message: "chunk group ended without an outcome".to_string(),
            })
        })
    }
}

struct JobGroup<T> {
    id: Uuid,
    label: String,
    remaining: AtomicUsize,
    failed: AtomicBool,
    results: Mutex<Vec<ChunkResult>>,
    continuation: Mutex<Option<Continuation<T>>>,
    outcome: Mutex<Option<oneshot::Sender<ServiceResult<T>>>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> JobGroup<T> {
    fn cancelled_error(&self) -> ServiceError {
        ServiceError::Cancelled {
            document_id: self.label.clone(),
        }
    }

    async fn complete_one(&self, result: ChunkResult) {
        if self.failed.load(Ordering::SeqCst) {
            metrics::counter!("folio_chunks_total", "outcome" => "discarded").increment(1);
            debug!(group_id = %self.id, chunk = result.key(), "Discarding result of failed group");
            return;
        }

        metrics::counter!("folio_chunks_total", "outcome" => "success").increment(1);
        self.results.lock().await.push(result);

        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finish().await;
        }
    }

    async fn finish(&self) {
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        let Some(continuation) = self.continuation.lock().await.take() else {
            return;
        };
        let results = std::mem::take(&mut *self.results.lock().await);

        debug!(group_id = %self.id, results = results.len(), "All chunks finished");
        let outcome = AssertUnwindSafe(continuation(results))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(ServiceError::Internal {
                    message: "group continuation panicked".to_string(),
                })
            });
        self.send(outcome).await;
    }

    async fn fail(&self, error: ServiceError) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            group_id = %self.id,
            label = %self.label,
            error = %format_error_chain_ref(&error),
            "Chunk group failed"
        );
        self.cancel.cancel();
        self.send(Err(error)).await;
    }

    async fn send(&self, outcome: ServiceResult<T>) {
        if let Some(tx) = self.outcome.lock().await.take() {
            // The handle may have been dropped
            let _ = tx.send(outcome);
        }
    }
}

async fn run_chunk<T, W, WF>(
    group: Arc<JobGroup<T>>,
    chunk: Chunk,
    on_each: Arc<W>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
) where
    T: Send + 'static,
    W: Fn(Chunk) -> WF + Send + Sync,
    WF: Future<Output = ServiceResult<ChunkResult>> + Send,
{
    let key = chunk.key();

    let _permit = tokio::select! {
        _ = group.cancel.cancelled() => {
            group.fail(group.cancelled_error()).await;
            return;
        }
        permit = Arc::clone(&permits).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                group
                    .fail(ServiceError::Internal {
                        message: "dispatcher closed".to_string(),
                    })
                    .await;
                return;
            }
        },
    };

    let operation = format!("chunk {} of {}", key, group.label);
    let outcome = retry
        .run(&operation, &group.cancel, |attempt| {
            let invocation = AssertUnwindSafe((*on_each)(chunk.clone())).catch_unwind();
            let cancel = group.cancel.clone();
            let cancelled = group.cancelled_error();
            async move {
                metrics::counter!("folio_chunk_attempts_total").increment(1);
                debug!(chunk = key, attempt, "Chunk attempt started");
                tokio::select! {
                    _ = cancel.cancelled() => Err(cancelled),
                    result = invocation => result.unwrap_or_else(|_| {
                        Err(ServiceError::Internal {
                            message: format!("chunk {} worker panicked", key),
                        })
                    }),
                }
            }
        })
        .await;

    match outcome {
        Ok(result) => group.complete_one(result).await,
        Err(_) if group.cancel.is_cancelled() => {
            metrics::counter!("folio_chunks_total", "outcome" => "cancelled").increment(1);
            group.fail(group.cancelled_error()).await;
        }
        Err(error) => {
            metrics::counter!("folio_chunks_total", "outcome" => "failed").increment(1);
            group.fail(error).await;
        }
    }
}
