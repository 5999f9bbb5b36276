use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, body::Body, http::Request};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::db::{DbHandle, TransferDb};
use super::erp::Erp;
use super::service::TransferService;
use crate::config::StockflowConfig;

/// Capacity of the change-feed channel. Slow WebSocket clients past this
/// many messages behind are told they lagged.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the transfer server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            db_path: PathBuf::from(".stockflow/stockflow.db"),
            dev_mode: false,
        }
    }
}

impl From<&StockflowConfig> for ServerConfig {
    fn from(config: &StockflowConfig) -> Self {
        Self {
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            dev_mode: config.server.dev_mode,
        }
    }
}

/// Wire the service together over an opened database.
pub fn build_state(db: TransferDb, erp: Arc<dyn Erp>) -> Arc<AppState> {
    let (events, _rx) = broadcast::channel::<String>(EVENT_CHANNEL_CAPACITY);
    let service = TransferService::new(DbHandle::new(db), erp, events);
    Arc::new(AppState::new(service))
}

/// Build the full application router: REST API, WebSocket feed and request
/// tracing. CORS is opened up only in dev mode.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                let request_id = uuid::Uuid::new_v4();
                tracing::info_span!(
                    "http_request",
                    %request_id,
                    method = %req.method(),
                    uri = %req.uri(),
                )
            }),
        );

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Start the transfer server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig, erp: Arc<dyn Erp>) -> Result<()> {
    let db = TransferDb::new(&config.db_path).with_context(|| {
        format!(
            "Failed to initialize transfer database at {}",
            config.db_path.display()
        )
    })?;
    let app = build_router(build_state(db, erp), config.dev_mode);

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, db = %config.db_path.display(), "Transfer server listening");
    println!("Stockflow running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
