//! HTTP API for the Folio service.
//!
//! This module provides the REST API endpoints for:
//! - Health and metrics monitoring
//! - Document registration, status and results
//! - Re-triggering and cancelling processing runs

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::FolioService;

pub mod documents;
use documents::{
    cancel_document_handler, get_document_handler, list_documents_handler,
    process_document_handler, register_document_handler,
};

/// Application state
pub struct AppState {
    pub service: Arc<FolioService>,
    pub start_time: Instant,
    /// Absent when no Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

/// Build the API router
pub fn router(service: Arc<FolioService>, metrics: Option<PrometheusHandle>) -> Router {
    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
        metrics,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/documents",
            get(list_documents_handler).post(register_document_handler),
        )
        .route("/documents/{id}", get(get_document_handler))
        .route("/documents/{id}/process", post(process_document_handler))
        .route("/documents/{id}/cancel", post(cancel_document_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health & Metrics ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (backend, available) = state.service.entity_backend_status().await;

    let status = if available {
        "healthy".to_string()
    } else {
        format!("degraded: {} entity backend unavailable", backend)
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        entity_backend: backend,
        entity_backend_available: available,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    entity_backend: &'static str,
    entity_backend_available: bool,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
