//! Worktree manager for creating, inspecting, and cleaning up git worktrees.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error types for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("worktree not found: {0}")]
    NotFound(String),

    #[error("git command failed: {0}")]
    GitError(String),
}

/// Information about a created worktree
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    /// Bead the worktree belongs to
    pub task_id: String,

    /// Path to the worktree
    pub path: PathBuf,

    /// Branch name
    pub branch: String,
}

/// Manager for git worktrees
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    /// Path to the main repository
    repo_root: PathBuf,

    /// Base directory for worktrees
    base_dir: PathBuf,

    /// Branch prefix for worktree branches
    branch_prefix: String,

    /// Configured base branch; empty means detect from origin/HEAD
    base_branch: String,
}

impl WorktreeManager {
    pub fn new(repo_root: PathBuf, base_dir: PathBuf, branch_prefix: String, base_branch: String) -> Self {
        Self {
            repo_root,
            base_dir,
            branch_prefix,
            base_branch,
        }
    }

    /// The repository the worktrees fork from
    pub fn repo_path(&self) -> &Path {
        &self.repo_root
    }

    /// Branch name for a bead's worktree
    pub fn branch_for(&self, task_id: &str) -> String {
        format!("{}/{}", self.branch_prefix, task_id)
    }

    /// Worktree path for a bead
    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(task_id)
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output, WorktreeError> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))
    }

    /// The branch worktrees fork from and merge back into.
    ///
    /// Uses the configured base branch when set, otherwise resolves
    /// origin/HEAD, otherwise falls back to `main` / `master`.
    pub async fn base_branch(&self) -> Result<String, WorktreeError> {
        if !self.base_branch.is_empty() {
            return Ok(self.base_branch.clone());
        }

        let output = self
            .git(&self.repo_root, &["symbolic-ref", "refs/remotes/origin/HEAD"])
            .await?;
        if output.status.success() {
            let full = String::from_utf8_lossy(&output.stdout);
            if let Some(branch) = full.trim().strip_prefix("refs/remotes/origin/") {
                return Ok(branch.to_string());
            }
        }

        for candidate in ["main", "master"] {
            let probe = self
                .git(&self.repo_root, &["rev-parse", "--verify", "--quiet", candidate])
                .await?;
            if probe.status.success() {
                return Ok(candidate.to_string());
            }
        }

        Ok("main".to_string())
    }

    /// Create a new worktree for a bead, branching off the base branch
    pub async fn create(&self, task_id: &str) -> Result<WorktreeInfo, WorktreeError> {
        debug!(%task_id, "Creating worktree");

        if let Err(e) = tokio::fs::create_dir_all(&self.base_dir).await {
            return Err(WorktreeError::CreateFailed(format!("failed to create base dir: {e}")));
        }

        let worktree_path = self.worktree_path(task_id);
        let branch = self.branch_for(task_id);
        let base = self.base_branch().await?;

        let output = self
            .git(
                &self.repo_root,
                &[
                    "worktree",
                    "add",
                    worktree_path.to_str().unwrap_or_default(),
                    "-b",
                    &branch,
                    &base,
                ],
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorktreeError::CreateFailed(stderr.trim().to_string()));
        }

        info!(%task_id, path = %worktree_path.display(), %branch, "Created worktree");
        Ok(WorktreeInfo {
            task_id: task_id.to_string(),
            path: worktree_path,
            branch,
        })
    }

    /// Look up an existing worktree
    pub fn get(&self, task_id: &str) -> Option<WorktreeInfo> {
        let path = self.worktree_path(task_id);
        path.is_dir().then(|| WorktreeInfo {
            task_id: task_id.to_string(),
            path,
            branch: self.branch_for(task_id),
        })
    }

    /// Remove a bead's worktree; missing worktrees are a no-op
    pub async fn remove(&self, task_id: &str) -> Result<(), WorktreeError> {
        let worktree_path = self.worktree_path(task_id);

        if !worktree_path.exists() {
            debug!(%task_id, "Worktree already gone, skipping removal");
            return Ok(());
        }

        let output = self
            .git(
                &self.repo_root,
                &[
                    "worktree",
                    "remove",
                    worktree_path.to_str().unwrap_or_default(),
                    "--force",
                ],
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("is not a working tree") {
                return Err(WorktreeError::RemoveFailed(stderr.trim().to_string()));
            }
        }

        info!(%task_id, "Removed worktree");
        Ok(())
    }

    /// Delete a worktree branch; failures are logged, not fatal
    pub async fn delete_branch(&self, branch: &str) {
        let result = self.git(&self.repo_root, &["branch", "-D", branch]).await;
        match result {
            Ok(output) if !output.status.success() => {
                warn!(%branch, stderr = %String::from_utf8_lossy(&output.stderr).trim(), "Branch deletion failed");
            }
            Err(e) => warn!(%branch, error = %e, "Branch deletion failed"),
            _ => debug!(%branch, "Deleted branch"),
        }
    }

    /// Commit any uncommitted changes in a worktree; clean trees are a no-op
    pub async fn commit_worktree(&self, worktree_path: &Path) -> Result<(), WorktreeError> {
        let status = self.git(worktree_path, &["status", "--porcelain"]).await?;
        if status.stdout.is_empty() {
            debug!(path = %worktree_path.display(), "Worktree clean, nothing to commit");
            return Ok(());
        }

        let add = self.git(worktree_path, &["add", "-A"]).await?;
        if !add.status.success() {
            return Err(WorktreeError::GitError(
                String::from_utf8_lossy(&add.stderr).trim().to_string(),
            ));
        }

        let commit = self
            .git(worktree_path, &["commit", "-m", "coven: auto-commit worktree changes"])
            .await?;
        if !commit.status.success() {
            return Err(WorktreeError::GitError(
                String::from_utf8_lossy(&commit.stderr).trim().to_string(),
            ));
        }

        info!(path = %worktree_path.display(), "Committed worktree changes");
        Ok(())
    }

    /// List worktrees currently on disk
    pub async fn list(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let mut worktrees = Vec::new();
        if !self.base_dir.exists() {
            return Ok(worktrees);
        }

        let mut entries = tokio::fs::read_dir(&self.base_dir)
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let task_id = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let branch = self.branch_for(&task_id);
            worktrees.push(WorktreeInfo { task_id, path, branch });
        }
        Ok(worktrees)
    }

    /// Remove worktrees whose bead is no longer active; returns the count
    pub async fn cleanup_orphaned(&self, active_task_ids: &[String]) -> Result<usize, WorktreeError> {
        let mut cleaned = 0;
        for wt in self.list().await? {
            if active_task_ids.contains(&wt.task_id) {
                continue;
            }
            info!(task_id = %wt.task_id, "Cleaning up orphaned worktree");
            match self.remove(&wt.task_id).await {
                Ok(()) => {
                    self.delete_branch(&wt.branch).await;
                    cleaned += 1;
                }
                Err(e) => warn!(task_id = %wt.task_id, error = %e, "Failed to remove orphaned worktree"),
            }
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn setup_git_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    pub(crate) fn manager(repo: &Path, worktrees: &Path) -> WorktreeManager {
        WorktreeManager::new(
            repo.to_path_buf(),
            worktrees.to_path_buf(),
            "coven".to_string(),
            String::new(),
        )
    }

    #[tokio::test]
    async fn test_create_and_remove() {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        setup_git_repo(repo.path()).await;
        let mgr = manager(repo.path(), trees.path());

        let info = mgr.create("bd-1").await.unwrap();
        assert!(info.path.is_dir());
        assert_eq!(info.branch, "coven/bd-1");
        assert!(mgr.get("bd-1").is_some());

        mgr.remove("bd-1").await.unwrap();
        assert!(!info.path.exists());
        assert!(mgr.get("bd-1").is_none());

        // Removing again is a no-op
        mgr.remove("bd-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_base_branch_detection() {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        setup_git_repo(repo.path()).await;

        let mgr = manager(repo.path(), trees.path());
        assert_eq!(mgr.base_branch().await.unwrap(), "main");

        let pinned = WorktreeManager::new(
            repo.path().to_path_buf(),
            trees.path().to_path_buf(),
            "coven".to_string(),
            "develop".to_string(),
        );
        assert_eq!(pinned.base_branch().await.unwrap(), "develop");
    }

    #[tokio::test]
    async fn test_commit_worktree() {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        setup_git_repo(repo.path()).await;
        let mgr = manager(repo.path(), trees.path());

        let info = mgr.create("bd-1").await.unwrap();

        // Clean tree: no-op
        mgr.commit_worktree(&info.path).await.unwrap();

        std::fs::write(info.path.join("new.txt"), "content").unwrap();
        mgr.commit_worktree(&info.path).await.unwrap();

        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&info.path)
            .output()
            .await
            .unwrap();
        assert!(status.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_orphaned() {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        setup_git_repo(repo.path()).await;
        let mgr = manager(repo.path(), trees.path());

        mgr.create("bd-1").await.unwrap();
        mgr.create("bd-2").await.unwrap();
        mgr.create("bd-3").await.unwrap();

        let active = vec!["bd-2".to_string()];
        let cleaned = mgr.cleanup_orphaned(&active).await.unwrap();
        assert_eq!(cleaned, 2);
        assert!(mgr.get("bd-1").is_none());
        assert!(mgr.get("bd-2").is_some());
        assert!(mgr.get("bd-3").is_none());
    }
}
