//! Covend configuration types and loading, plus the `.coven/` workspace layout.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduler limits and cadence
    pub scheduler: SchedulerSection,

    /// Agent subprocess configuration
    pub agent: AgentSection,

    /// Workflow step defaults
    pub workflow: WorkflowSection,

    /// Grimoire routing
    pub grimoires: GrimoireSection,

    /// Git configuration
    pub git: GitSection,
}

impl Config {
    /// Load configuration with fallback chain:
    /// explicit path, `.coven/config.yml`, `~/.config/coven/config.yml`, defaults.
    pub fn load(workspace: &Path, config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = workspace.join(".coven").join("config.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("coven").join("config.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Scheduler limits and cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Maximum concurrently running agents
    #[serde(rename = "max-agents")]
    pub max_agents: usize,

    /// Reconcile tick interval in milliseconds
    #[serde(rename = "reconcile-interval-ms")]
    pub reconcile_interval_ms: u64,

    /// Cleanup tick interval in milliseconds
    #[serde(rename = "cleanup-interval-ms")]
    pub cleanup_interval_ms: u64,

    /// Snapshot heartbeat interval in milliseconds
    #[serde(rename = "snapshot-interval-ms")]
    pub snapshot_interval_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_agents: 3,
            reconcile_interval_ms: 5_000,
            cleanup_interval_ms: 3_600_000,
            snapshot_interval_ms: 30_000,
        }
    }
}

impl SchedulerSection {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

/// Agent subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Command line launched for agent steps; the rendered spell goes to stdin
    #[serde(rename = "command")]
    pub command: String,

    /// Default agent step timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: "claude -p".to_string(),
            timeout_ms: 900_000,
        }
    }
}

/// Workflow step defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    /// Default script step timeout in milliseconds
    #[serde(rename = "script-timeout-ms")]
    pub script_timeout_ms: u64,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            script_timeout_ms: 300_000,
        }
    }
}

/// Grimoire routing: which step program runs for which bead
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrimoireSection {
    /// Grimoire used when no label or type mapping applies
    #[serde(rename = "default")]
    pub default_grimoire: String,

    /// Bead type to grimoire name
    #[serde(rename = "by-type")]
    pub by_type: HashMap<String, String>,
}

impl Default for GrimoireSection {
    fn default() -> Self {
        Self {
            default_grimoire: "standard".to_string(),
            by_type: HashMap::new(),
        }
    }
}

/// Git configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSection {
    /// Base branch to fork worktrees from and merge back into.
    /// Empty means auto-detect from origin/HEAD.
    #[serde(rename = "base-branch")]
    pub base_branch: String,

    /// Branch prefix for worktree branches
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            base_branch: String::new(),
            branch_prefix: "coven".to_string(),
        }
    }
}

/// Filesystem layout under `<workspace>/.coven/`
#[derive(Debug, Clone)]
pub struct CovenPaths {
    root: PathBuf,
}

impl CovenPaths {
    /// Layout rooted at the workspace directory
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self {
            root: workspace.as_ref().join(".coven"),
        }
    }

    /// `.coven/` itself
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The workspace the layout belongs to
    pub fn workspace(&self) -> &Path {
        self.root.parent().unwrap_or(&self.root)
    }

    pub fn socket(&self) -> PathBuf {
        self.root.join("covend.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("covend.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("covend.log")
    }

    pub fn grimoire_dir(&self) -> PathBuf {
        self.root.join("grimoires")
    }

    pub fn spell_dir(&self) -> PathBuf {
        self.root.join("spells")
    }

    pub fn workflow_dir(&self) -> PathBuf {
        self.root.join("workflows")
    }

    pub fn worktree_dir(&self) -> PathBuf {
        self.root.join("worktrees")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Rolling output log for one bead's agents
    pub fn output_log(&self, task_id: &str) -> PathBuf {
        self.output_dir().join(format!("{task_id}.log"))
    }

    /// Create every directory the daemon writes into
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.grimoire_dir(),
            self.spell_dir(),
            self.workflow_dir(),
            self.worktree_dir(),
            self.output_dir(),
        ] {
            fs::create_dir_all(&dir).context(format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
