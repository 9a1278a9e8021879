//! `bd` CLI adapter for the task store contract.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{Bead, BeadStatus};

use super::{TaskStore, TaskStoreError};

/// Task store backed by the `bd` issue tracker CLI
#[derive(Debug, Clone)]
pub struct BeadsCli {
    program: String,
    workspace: PathBuf,
}

impl BeadsCli {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            program: "bd".to_string(),
            workspace,
        }
    }

    /// Override the CLI binary (for wrappers and tests)
    pub fn with_program(program: impl Into<String>, workspace: PathBuf) -> Self {
        Self {
            program: program.into(),
            workspace,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, TaskStoreError> {
        debug!(program = %self.program, ?args, "Invoking task store CLI");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.workspace)
            .output()
            .await
            .map_err(|e| TaskStoreError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TaskStoreError::Unavailable(stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl TaskStore for BeadsCli {
    async fn list_ready(&self) -> Result<Vec<Bead>, TaskStoreError> {
        let stdout = self.run(&["ready", "--json"]).await?;
        if stdout.trim().is_empty() {
            return Ok(vec![]);
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    async fn get(&self, id: &str) -> Result<Option<Bead>, TaskStoreError> {
        match self.run(&["show", id, "--json"]).await {
            Ok(stdout) => Ok(Some(serde_json::from_str(&stdout)?)),
            // The CLI reports unknown ids on stderr with a non-zero exit
            Err(TaskStoreError::Unavailable(msg)) if msg.contains("not found") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_status(&self, id: &str, status: BeadStatus) -> Result<(), TaskStoreError> {
        self.run(&["update", id, "--status", status.as_str()]).await?;
        Ok(())
    }
}
