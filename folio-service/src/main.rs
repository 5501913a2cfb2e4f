use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::{info, warn};

mod api;
mod config;
mod db;
mod error;
mod ollama;
mod pipeline;
mod service;

use crate::config::AppConfig;
use crate::db::Database;
use crate::service::FolioService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_logging();

    info!("Starting Folio service v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(AppConfig::load()?);
    info!(
        host = %config.server.host,
        port = config.server.port,
        chunk_size = config.pipeline.chunk_size,
        "Configuration loaded"
    );

    // Ensure data directory exists
    std::fs::create_dir_all(&config.storage.data_dir)?;

    // Initialize database
    let db_path = config.storage.data_dir.join("folio.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    // Prometheus recorder backing /metrics
    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to install metrics recorder; /metrics will be empty");
            None
        }
    };

    // Initialize the service
    let service = Arc::new(FolioService::new(db, config.clone()).await?);

    let app = api::router(service.clone(), metrics);

    // Start document processing worker (resumes any pending documents)
    FolioService::start_document_processing_worker(service.clone());

    // Start the server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("folio_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
