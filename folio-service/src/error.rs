use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Invalid chunk plan: {message}")]
    Planning { message: String },

    #[error("Text extraction failed for pages {pages:?}")]
    Extraction {
        pages: Vec<u32>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Entity extraction failed: {message}")]
    EntityExtraction { message: String },

    #[error("Chunk starting at page {chunk_key} timed out after {timeout:?}")]
    ChunkTimeout {
        chunk_key: u32,
        timeout: std::time::Duration,
    },

    #[error("Failed to persist result for document {document_id} after {attempts} attempts")]
    AggregationPersist {
        document_id: String,
        attempts: u32,
        #[source]
        source: Box<ServiceError>,
    },

    #[error("Processing cancelled for document {document_id}")]
    Cancelled { document_id: String },

    #[error("{0}")]
    Ollama(#[from] OllamaError),

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Ollama client errors
#[derive(Error, Debug)]
pub enum OllamaError {
    #[error("Connection failed to Ollama at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Generation failed (status {status}): {message}")]
    Generation { status: u16, message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    /// Build an extraction error from any displayable cause.
    pub fn extraction(pages: &[u32], message: impl Into<String>) -> Self {
        ServiceError::Extraction {
            pages: pages.to_vec(),
            source: Box::new(std::io::Error::other(message.into())),
        }
    }

    /// Whether a chunk invocation failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Extraction { .. }
                | ServiceError::EntityExtraction { .. }
                | ServiceError::ChunkTimeout { .. }
                | ServiceError::Ollama(_)
                | ServiceError::Database(DatabaseError::Query(_))
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::DocumentNotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::InvalidRequest { .. } | ServiceError::Planning { .. } => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Cancelled { .. } => StatusCode::CONFLICT,
            ServiceError::Extraction { .. } | ServiceError::EntityExtraction { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::Planning { .. } => "planning_error",
            ServiceError::Extraction { .. } => "extraction_error",
            ServiceError::EntityExtraction { .. } => "entity_extraction_error",
            ServiceError::ChunkTimeout { .. } => "chunk_timeout",
            ServiceError::AggregationPersist { .. } => "aggregation_persist_error",
            ServiceError::Cancelled { .. } => "cancelled",
            ServiceError::Ollama(OllamaError::Connection { .. }) => "ollama_connection",
            ServiceError::Ollama(OllamaError::Generation { .. }) => "ollama_generation",
            ServiceError::Database(_) => "database_error",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        let response = ErrorResponse {
            message: format_error_chain_ref(&self),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error and every `source()` below it as one line.
pub fn format_error_chain_ref(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut current = error.source();
    while let Some(cause) = current {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        current = cause.source();
    }
    message
}
