//! Document API endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::Document;
use crate::error::ServiceError;

use super::AppState;

/// Request to register a document file
#[derive(Deserialize)]
pub struct RegisterDocumentRequest {
    pub title: Option<String>,
    pub file_path: String,
}

/// Response for cancellation requests
#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// List all documents, newest first
pub async fn list_documents_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Document>>, ServiceError> {
    let documents = state.service.list_documents()?;
    Ok(Json(documents))
}

/// Register a document; the processing worker picks it up
pub async fn register_document_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterDocumentRequest>,
) -> Result<(StatusCode, Json<Document>), ServiceError> {
    let document = state
        .service
        .register_document(request.title, &request.file_path)?;
    Ok((StatusCode::CREATED, Json(document)))
}

/// Get a specific document by ID
pub async fn get_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Document>, ServiceError> {
    let document = state.service.get_document(&id)?;
    Ok(Json(document))
}

/// Queue a document for a fresh run
pub async fn process_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Document>), ServiceError> {
    let document = state.service.reprocess_document(&id)?;
    Ok((StatusCode::ACCEPTED, Json(document)))
}

/// Cancel the in-flight run of a document
pub async fn cancel_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ServiceError> {
    let cancelled = state.service.cancel_processing(&id)?;
    Ok(Json(CancelResponse { cancelled }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::Database;
    use crate::db::models::ProcessingStatus;
    use crate::service::FolioService;
    use axum::response::IntoResponse;
    use std::io::Write;
    use std::time::Instant;

    async fn state() -> Arc<AppState> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let service = FolioService::new(db, Arc::new(AppConfig::default()))
            .await
            .unwrap();
        Arc::new(AppState {
            service: Arc::new(service),
            start_time: Instant::now(),
            metrics: None,
        })
    }

    #[tokio::test]
    async fn test_register_get_and_requeue() {
        let state = state().await;
        let mut file = tempfile::Builder::new().suffix(".md").tempfile().unwrap();
        file.write_all(b"# Notes").unwrap();

        let (status, Json(created)) = register_document_handler(
            State(state.clone()),
            Json(RegisterDocumentRequest {
                title: Some("Notes".to_string()),
                file_path: file.path().to_string_lossy().into_owned(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.title, "Notes");

        let Json(fetched) = get_document_handler(State(state.clone()), Path(created.id.clone()))
            .await
            .unwrap();
        assert_eq!(fetched.id, created.id);

        let (status, Json(queued)) =
            process_document_handler(State(state.clone()), Path(created.id.clone()))
                .await
                .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(queued.processing_status, ProcessingStatus::Pending);

        let Json(all) = list_documents_handler(State(state)).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_document_is_404() {
        let state = state().await;

        let err = cancel_document_handler(State(state), Path("missing".to_string()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_registration_is_400() {
        let state = state().await;

        let err = register_document_handler(
            State(state),
            Json(RegisterDocumentRequest {
                title: None,
                file_path: "/tmp/slides.pptx".to_string(),
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
