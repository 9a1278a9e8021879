//! CLI command definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// covend - per-workspace daemon driving AI coding agents through grimoires
#[derive(Parser)]
#[command(
    name = "covend",
    about = "Workspace daemon orchestrating AI coding agents over git worktrees",
    version = env!("GIT_DESCRIBE"),
    after_help = "Daemon logs are written to: .coven/covend.log"
)]
pub struct Cli {
    /// Path to config file (default: .coven/config.yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Workspace directory (default: current directory)
    #[arg(short, long, global = true)]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Start the daemon for this workspace
    Start {
        /// Don't fork to background (run in foreground, log to stderr)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Show daemon logs
    Logs {
        /// Number of lines to show
        #[arg(short, long, default_value = "50")]
        lines: usize,
    },

    /// Internal: run as the daemon process (used by `start`)
    #[command(hide = true)]
    RunDaemon,
}
