//! Chunked document pipeline.
//!
//! A document is planned into page chunks, every chunk runs through the text
//! and entity stages concurrently, and once all chunks have succeeded the
//! results are combined and written to the record store exactly once.

mod aggregator;
mod coordinator;
mod dispatcher;
mod entities;
mod planner;
mod reader;
mod retry;
mod stages;
mod state;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::Coordinator;
pub use entities::EntityExtractor;
pub use reader::{FilePageReader, PageReader};
pub use stages::StageExecutor;
pub use state::PipelineState;
pub use types::{DocumentHandle, DocumentResult};

use crate::error::ServiceResult;

/// Where run outcomes and progress are written.
///
/// `save_result` overwrites any earlier result for the document, so writing
/// the same result twice leaves the record unchanged.
pub trait RecordStore: Send + Sync {
    fn save_result(
        &self,
        document_id: &str,
        run_id: &str,
        result: &DocumentResult,
    ) -> ServiceResult<()>;

    /// Mirror the run's state, with an error message for failed runs
    fn record_state(
        &self,
        document_id: &str,
        state: PipelineState,
        error: Option<&str>,
    ) -> ServiceResult<()>;

    fn record_progress(&self, document_id: &str, completed: usize, total: usize) -> ServiceResult<()>;
}
