//! AgentRecord - the per-task runtime record of an agent run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Runtime status of an agent working a bead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
}

impl AgentStatus {
    /// Whether the agent is still occupying a concurrency slot
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// Per-task runtime record, created when the scheduler picks a bead.
///
/// Never reused across beads: a restarted bead gets a fresh record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    /// Bead this agent is working
    pub task_id: String,

    /// Isolated checkout the agent mutates
    pub worktree_path: PathBuf,

    /// Branch backing the worktree
    pub branch: String,

    /// Current status
    pub status: AgentStatus,

    /// When the scheduler created this record
    pub started_at: DateTime<Utc>,

    /// Exit code of the final agent subprocess, when known
    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Terminal error message, when failed
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentRecord {
    /// New record in `Starting` state
    pub fn new(task_id: impl Into<String>, worktree_path: PathBuf, branch: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            worktree_path,
            branch: branch.into(),
            status: AgentStatus::Starting,
            started_at: Utc::now(),
            exit_code: None,
            error: None,
        }
    }
}
