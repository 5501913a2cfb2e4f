//! Document record operations.

use std::path::Path;

use tracing::info;
use uuid::Uuid;

use crate::db::Document;
use crate::error::{ServiceError, ServiceResult};
use crate::pipeline::FilePageReader;
use crate::service::FolioService;

impl FolioService {
    /// Register a document file; it is queued as `pending`
    pub fn register_document(&self, title: Option<String>, file_path: &str) -> ServiceResult<Document> {
        let path = Path::new(file_path);
        if file_path.trim().is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "file_path must not be empty".to_string(),
            });
        }
        if !FilePageReader::supports(path) {
            return Err(ServiceError::InvalidRequest {
                message: format!("Unsupported document format: {}", file_path),
            });
        }
        if !path.is_file() {
            return Err(ServiceError::InvalidRequest {
                message: format!("Document file not found: {}", file_path),
            });
        }

        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| file_path.to_string());

        let document = Document::new_pending(Uuid::new_v4().to_string(), title, file_path.to_string());
        self.db.insert_document(&document)?;

        info!(doc_id = %document.id, title = %document.title, path = %file_path, "Document registered");
        Ok(document)
    }

    pub fn get_document(&self, document_id: &str) -> ServiceResult<Document> {
        self.db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })
    }

    pub fn list_documents(&self) -> ServiceResult<Vec<Document>> {
        self.db.list_documents()
    }
}
