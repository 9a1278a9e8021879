//! Durable workflow state - one JSON file per active bead under
//! `.coven/workflows/`, written after every step transition and deleted
//! only on successful completion. At startup the persister enumerates
//! interrupted runs so the scheduler can resume them.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Lifecycle status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    PendingMerge,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states never resume; `Running` and `PendingMerge` do
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running | Self::PendingMerge)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::PendingMerge => "pending_merge",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Durable record of one workflow run, keyed by task id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// Run identity: `wf-<taskId>-<nanos>`
    pub workflow_id: String,

    /// Bead this run belongs to
    pub task_id: String,

    /// Name of the grimoire being executed
    pub grimoire: String,

    /// Index of the next top-level step to execute
    pub current_step: usize,

    /// Variable context root, rehydrated on resume
    pub variables: Map<String, Value>,

    /// Worktree the run owns
    pub worktree_path: PathBuf,

    /// Branch backing the worktree
    pub branch: String,

    pub status: WorkflowStatus,

    #[serde(default)]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh run starting at step 0
    pub fn new(task_id: impl Into<String>, grimoire: impl Into<String>, worktree_path: PathBuf, branch: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self {
            workflow_id: format!("wf-{task_id}-{nanos}"),
            task_id,
            grimoire: grimoire.into(),
            current_step: 0,
            variables: Map::new(),
            worktree_path,
            branch: branch.into(),
            status: WorkflowStatus::Running,
            error: None,
            started_at: Utc::now(),
        }
    }
}

/// Errors from reading or writing persisted state
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to access workflow state: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode workflow state: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Reads and writes `workflows/<taskId>.json`
#[derive(Debug, Clone)]
pub struct WorkflowPersister {
    dir: PathBuf,
}

impl WorkflowPersister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    /// Persist a run's state atomically (temp file + rename)
    pub fn save(&self, state: &WorkflowState) -> Result<(), PersistError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&state.task_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &path)?;
        debug!(task_id = %state.task_id, step = state.current_step, status = %state.status, "Persisted workflow state");
        Ok(())
    }

    /// Load a run's state, if one is persisted
    pub fn load(&self, task_id: &str) -> Result<Option<WorkflowState>, PersistError> {
        let path = self.path_for(task_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Remove a run's state (after terminal `completed`)
    pub fn delete(&self, task_id: &str) -> Result<(), PersistError> {
        let path = self.path_for(task_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All persisted states, unreadable files skipped with a warning
    pub fn list_all(&self) -> Result<Vec<WorkflowState>, PersistError> {
        let mut states = Vec::new();
        if !self.dir.is_dir() {
            return Ok(states);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fs::read_to_string(&path).map_err(PersistError::from).and_then(|c| Ok(serde_json::from_str(&c)?)) {
                Ok(state) => states.push(state),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable workflow state"),
            }
        }
        Ok(states)
    }

    /// Runs interrupted before reaching a terminal status
    pub fn list_interrupted(&self) -> Result<Vec<WorkflowState>, PersistError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect())
    }
}
