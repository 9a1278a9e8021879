//! Merging a worktree branch back into the base branch.
//!
//! The merge happens in the main repository checkout with `--no-ff`. On
//! conflict the in-progress merge is aborted and the conflicting file list
//! is reported so the caller can surface it for manual resolution.

use std::path::Path;

use eyre::{Result, bail};
use tokio::process::Command;
use tracing::{info, warn};

/// Result of a merge attempt
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// Merge succeeded; carries the merge commit id
    Merged { commit: String },
    /// Merge conflicted on these files; the merge was aborted
    Conflicts { files: Vec<String> },
}

impl MergeOutcome {
    pub fn has_conflicts(&self) -> bool {
        matches!(self, Self::Conflicts { .. })
    }
}

async fn git(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    Ok(Command::new("git").args(args).current_dir(dir).output().await?)
}

/// Merge `source_branch` into `base_branch` inside the main repository.
///
/// The base checkout is switched to `base_branch` first; conflicts leave the
/// repository clean (merge aborted) and report the conflicting paths.
pub async fn merge_to_main(repo_path: &Path, source_branch: &str, base_branch: &str) -> Result<MergeOutcome> {
    info!(%source_branch, %base_branch, "Merging worktree branch");

    let checkout = git(repo_path, &["checkout", base_branch]).await?;
    if !checkout.status.success() {
        bail!(
            "failed to checkout {}: {}",
            base_branch,
            String::from_utf8_lossy(&checkout.stderr).trim()
        );
    }

    let merge_msg = format!("Merge {source_branch} into {base_branch}");
    let merge = git(repo_path, &["merge", "--no-ff", source_branch, "-m", &merge_msg]).await?;

    if !merge.status.success() {
        let conflicts = conflicting_files(repo_path).await?;
        let abort = git(repo_path, &["merge", "--abort"]).await?;
        if !abort.status.success() {
            warn!(stderr = %String::from_utf8_lossy(&abort.stderr).trim(), "merge --abort failed");
        }

        if !conflicts.is_empty() {
            warn!(?conflicts, "Merge conflict detected");
            return Ok(MergeOutcome::Conflicts { files: conflicts });
        }
        bail!(
            "merge of {} failed: {}",
            source_branch,
            String::from_utf8_lossy(&merge.stderr).trim()
        );
    }

    let head = git(repo_path, &["rev-parse", "HEAD"]).await?;
    let commit = String::from_utf8_lossy(&head.stdout).trim().to_string();
    info!(%commit, "Merge completed");
    Ok(MergeOutcome::Merged { commit })
}

/// Unmerged paths of an in-progress conflicted merge
async fn conflicting_files(repo_path: &Path) -> Result<Vec<String>> {
    let output = git(repo_path, &["diff", "--name-only", "--diff-filter=U"]).await?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .filter(|l| !l.is_empty())
        .collect())
}
