//! Task store driver - the external issue tracker boundary.
//!
//! Beads are owned by the external `bd` CLI; the daemon only reads ready
//! work and pushes status transitions. `MemoryTaskStore` backs tests and
//! offline development.

mod client;
mod memory;

use async_trait::async_trait;

use crate::domain::{Bead, BeadStatus};

pub use client::BeadsCli;
pub use memory::MemoryTaskStore;

/// Errors crossing the task store boundary
#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("task store returned malformed data: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown bead: {0}")]
    NotFound(String),
}

/// Fixed contract with the external task store
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Ready beads: open, dependencies satisfied, priority-ordered by the store
    async fn list_ready(&self) -> Result<Vec<Bead>, TaskStoreError>;

    /// Fetch a single bead
    async fn get(&self, id: &str) -> Result<Option<Bead>, TaskStoreError>;

    /// Push a status transition to the store
    async fn update_status(&self, id: &str, status: BeadStatus) -> Result<(), TaskStoreError>;
}
