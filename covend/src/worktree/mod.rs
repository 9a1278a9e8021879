//! Worktree management - the version control driver.
//!
//! One isolated checkout per active bead under `.coven/worktrees/`, owned
//! exclusively by that bead's workflow. Only the scheduler creates or
//! removes worktrees.

mod manager;
mod merge;

pub use manager::{WorktreeError, WorktreeInfo, WorktreeManager};
pub use merge::{merge_to_main, MergeOutcome};
