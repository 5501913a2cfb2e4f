//! Starting, re-triggering and cancelling pipeline runs.

use tracing::{debug, info};

use crate::db::Document;
use crate::error::{ServiceResult, format_error_chain_ref};
use crate::pipeline::DocumentHandle;
use crate::service::FolioService;

impl FolioService {
    /// Start a pipeline run for a document.
    ///
    /// Returns the run id once the run is dispatched; the outcome is written
    /// to the document record by the pipeline itself.
    pub async fn process_document(&self, document: &Document) -> String {
        let handle = DocumentHandle::new(document.id.clone(), document.file_path.clone());
        let run = self.coordinator.start(handle).await;
        let run_id = run.run_id().to_string();
        debug!(
            doc_id = %run.document_id(),
            run_id = %run_id,
            state = run.state().as_ref(),
            "Run started"
        );

        let title = document.title.clone();
        tokio::spawn(async move {
            let doc_id = run.document_id().to_string();
            let run_id = run.run_id().to_string();
            match run.wait().await {
                Ok(result) => info!(
                    doc_id = %doc_id,
                    run_id = %run_id,
                    title = %title,
                    chars = result.text.len(),
                    entities = result.entities.len(),
                    "Document processed"
                ),
                Err(e) => debug!(
                    doc_id = %doc_id,
                    run_id = %run_id,
                    error = %format_error_chain_ref(&e),
                    "Document run ended without a result"
                ),
            }
        });

        run_id
    }

    /// Queue a document for another run.
    ///
    /// A run still in flight is cancelled and can no longer touch the record.
    pub fn reprocess_document(&self, document_id: &str) -> ServiceResult<Document> {
        self.get_document(document_id)?;

        if self.coordinator.supersede(document_id) {
            info!(doc_id = %document_id, "Cancelled in-flight run before re-queueing");
        }
        self.db.mark_document_pending(document_id)?;
        info!(doc_id = %document_id, "Document queued for processing");

        self.get_document(document_id)
    }

    /// Cancel the in-flight run of a document. Returns false when nothing
    /// was running.
    pub fn cancel_processing(&self, document_id: &str) -> ServiceResult<bool> {
        self.get_document(document_id)?;
        Ok(self.coordinator.cancel(document_id))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::db::models::ProcessingStatus;
    use crate::db::{Database, Document};
    use crate::error::ServiceError;
    use crate::service::FolioService;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    async fn service() -> FolioService {
        let db = Arc::new(Database::open_in_memory().unwrap());
        FolioService::new(db, Arc::new(AppConfig::default()))
            .await
            .unwrap()
    }

    fn text_file(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    async fn wait_for_status(service: &FolioService, id: &str, status: ProcessingStatus) -> Document {
        for _ in 0..200 {
            let doc = service.get_document(id).unwrap();
            if doc.processing_status == status {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("document {} never reached {:?}", id, status);
    }

    #[tokio::test]
    async fn test_process_text_document() {
        let service = service().await;
        let file = text_file("Ada Lovelace wrote\x0cto Charles Babbage\x0cfrom London.");
        let doc = service
            .register_document(Some("Letters".to_string()), &file.path().to_string_lossy())
            .unwrap();

        let run_id = service.process_document(&doc).await;
        let done = wait_for_status(&service, &doc.id, ProcessingStatus::Completed).await;

        assert_eq!(done.result_run_id.as_deref(), Some(run_id.as_str()));
        assert_eq!(
            done.extracted_text.as_deref(),
            Some("Ada Lovelace wrote\n\nto Charles Babbage\n\nfrom London.")
        );
        assert_eq!(
            done.entities,
            Some(vec![
                "Ada Lovelace".to_string(),
                "Charles Babbage".to_string(),
                "London".to_string()
            ])
        );
        assert_eq!(done.chunks_total, Some(2));
    }

    #[tokio::test]
    async fn test_reprocess_requeues_and_keeps_result() {
        let service = service().await;
        let file = text_file("Paris");
        let doc = service
            .register_document(None, &file.path().to_string_lossy())
            .unwrap();
        service.process_document(&doc).await;
        wait_for_status(&service, &doc.id, ProcessingStatus::Completed).await;

        let queued = service.reprocess_document(&doc.id).unwrap();
        assert_eq!(queued.processing_status, ProcessingStatus::Pending);
        assert!(queued.processing_phase.is_none());
        assert_eq!(queued.extracted_text.as_deref(), Some("Paris"));
    }

    #[tokio::test]
    async fn test_cancel_without_run() {
        let service = service().await;
        let file = text_file("Paris");
        let doc = service
            .register_document(None, &file.path().to_string_lossy())
            .unwrap();

        assert!(!service.cancel_processing(&doc.id).unwrap());
        assert!(matches!(
            service.cancel_processing("missing"),
            Err(ServiceError::DocumentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_file_fails_run() {
        let service = service().await;
        let file = text_file("Paris");
        let doc = service
            .register_document(None, &file.path().to_string_lossy())
            .unwrap();
        drop(file);

        service.process_document(&doc).await;
        let failed = wait_for_status(&service, &doc.id, ProcessingStatus::Failed).await;
        assert_eq!(failed.processing_phase.as_deref(), Some("failed"));
        assert!(failed.processing_error.is_some());
    }
}
