//! JSON API over a [`ContextEngine`].
//!
//! # Module Structure
//!
//! - `handlers` - HTTP route handlers
//! - `models` - API request/response types and the error mapping

mod handlers;
mod models;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use isg_core::ContextEngine;

pub const DEFAULT_PORT: u16 = 3434;

// =============================================================================
// Application State
// =============================================================================

/// Shared application state for the server.
pub struct AppState {
    pub engine: ContextEngine,
}

// =============================================================================
// Server Entry Point
// =============================================================================

pub fn router(engine: ContextEngine) -> Router {
    let state = Arc::new(AppState { engine });

    Router::new()
        .route("/api/ingest", post(handlers::ingest))
        .route("/api/query", post(handlers::query))
        .route("/api/candidates", post(handlers::submit))
        .route("/api/candidates/{id}", get(handlers::candidate))
        .route("/api/candidates/{id}/report", get(handlers::report))
        .route("/api/candidates/{id}/decision", post(handlers::decide))
        .route("/api/versions", get(handlers::versions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}

/// Serve the API on localhost until the process is stopped.
pub async fn start_server(engine: ContextEngine, port: u16) -> anyhow::Result<()> {
    let app = router(engine);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Serving isg API");
    println!("Listening on http://{addr}");
    println!("Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;
    Ok(())
}
