//! Background worker for document processing.

use std::sync::Arc;

use tracing::{error, info};

use crate::error::format_error_chain_ref;
use crate::service::FolioService;

impl FolioService {
    /// Start the document processing worker.
    /// This should be called once on server startup
    pub fn start_document_processing_worker(service: Arc<FolioService>) {
        // Runs that were in flight when the last process stopped start over
        match service.db.requeue_interrupted_documents() {
            Ok(count) if count > 0 => info!(count, "Re-queued interrupted documents"),
            Err(e) => error!(error = %format_error_chain_ref(&e), "Failed to re-queue interrupted documents"),
            _ => {}
        }

        let poll_interval = service.config.pipeline.poll_interval();
        tokio::spawn(async move {
            info!("Document processing worker started");
            loop {
                match service.db.claim_next_pending_document() {
                    Ok(Some(doc)) => {
                        info!(doc_id = %doc.id, title = %doc.title, "Processing queued document");
                        service.process_document(&doc).await;
                    }
                    Ok(None) => {
                        tokio::time::sleep(poll_interval).await;
                    }
                    Err(e) => {
                        error!(error = %format_error_chain_ref(&e), "Failed to check for pending documents");
                        tokio::time::sleep(poll_interval * 2).await;
                    }
                }
            }
        });
    }
}
