//! Status HTTP server for the relay
//!
//! Exposes the supervisor status snapshot for health checks and dashboards.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;

use crate::status::{SharedStatus, SupervisorStatus};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status
async fn get_status(State(status): State<SharedStatus>) -> Json<SupervisorStatus> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Runs the status HTTP server on `addr` until it fails
pub async fn run_status_server(status: SharedStatus, addr: SocketAddr) -> Result<(), ServerError> {
    let app = create_status_router(status);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Status server listening");
    axum::serve(listener, app).await.map_err(ServerError::BindError)?;

    Ok(())
}
