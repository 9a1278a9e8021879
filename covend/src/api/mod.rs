//! Wire API - axum router served over the workspace unix socket.

mod client;
mod error;
mod routes;
mod sse;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use eyre::{Context, Result};
use tokio::net::UnixListener;
use tracing::{debug, info};

use crate::agent::AnswerRouter;
use crate::config::CovenPaths;
use crate::events::EventBus;
use crate::scheduler::Scheduler;
use crate::state::StateStore;
use crate::workflow::WorkflowPersister;

pub use client::{ApiResponse, DaemonClient};
pub use error::ApiError;
pub use routes::router;
pub use sse::spawn_snapshot_heartbeat;

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub bus: Arc<EventBus>,
    pub scheduler: Arc<Scheduler>,
    pub persister: WorkflowPersister,
    pub answers: AnswerRouter,
    pub paths: CovenPaths,
    pub started_at: Instant,
}

/// Bind the unix socket (removing a stale one) and serve until `shutdown`
pub async fn serve(state: AppState, socket_path: &Path, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }
    if socket_path.exists() {
        debug!(path = %socket_path.display(), "Removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind unix socket")?;
    info!(path = %socket_path.display(), "API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server failed")?;
    Ok(())
}
