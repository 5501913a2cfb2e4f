//! Deterministic merge of chunk results and the single result write.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ServiceError, ServiceResult};

use super::RecordStore;
use super::retry::RetryPolicy;
use super::types::{ChunkResult, DocumentResult, join_pages};

/// Merge chunk results in page order, whatever order they arrived in.
///
/// Texts are joined with the page separator and entity lists concatenated
/// without deduplication.
pub fn combine(mut results: Vec<ChunkResult>) -> DocumentResult {
    results.sort_by_key(ChunkResult::key);

    let text = join_pages(results.iter().map(|r| r.text.as_str()));
    let entities = results
        .into_iter()
        .flat_map(|r| r.entities)
        .collect::<Vec<_>>();

    debug!(chars = text.len(), entities = entities.len(), "Combined chunk results");
    DocumentResult { text, entities }
}

/// Write a document result, retrying transient store failures.
///
/// The write replaces any earlier result, so a retry after an ambiguous
/// failure cannot duplicate it. A cancelled run writes nothing and fails
/// with `Cancelled`, also when cancellation arrives during a backoff.
pub async fn persist(
    store: &dyn RecordStore,
    document_id: &str,
    run_id: &str,
    result: &DocumentResult,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> ServiceResult<()> {
    let cancelled = || ServiceError::Cancelled {
        document_id: document_id.to_string(),
    };
    if cancel.is_cancelled() {
        return Err(cancelled());
    }

    let operation = format!("persist result of {}", document_id);
    let mut attempts = 0;

    let outcome = policy
        .run(&operation, cancel, |_| {
            attempts += 1;
            let saved = store.save_result(document_id, run_id, result);
            async move { saved }
        })
        .await;
    outcome.map_err(|e| {
        if cancel.is_cancelled() {
            debug!(doc_id = %document_id, run_id = %run_id, attempts, "Result write abandoned");
            cancelled()
        } else {
            ServiceError::AggregationPersist {
                document_id: document_id.to_string(),
                attempts,
                source: Box::new(e),
            }
        }
    })?;

    info!(doc_id = %document_id, run_id = %run_id, attempts, "Document result persisted");
    Ok(())
}
