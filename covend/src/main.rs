//! covend - CLI entry point and daemon bootstrap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use covend::agent::{AnswerRouter, CommandAgentRunner};
use covend::api::{self, AppState, DaemonClient};
use covend::beads::BeadsCli;
use covend::cli::{Cli, Command};
use covend::config::{Config, CovenPaths};
use covend::daemon::DaemonManager;
use covend::events::EventBus;
use covend::grimoire::Library;
use covend::scheduler::{Scheduler, SchedulerDeps};
use covend::spell::SpellLoader;
use covend::state::StateStore;
use covend::workflow::WorkflowPersister;
use covend::worktree::WorktreeManager;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("COVEND_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
}

fn setup_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

fn setup_file_logging(paths: &CovenPaths) -> Result<()> {
    std::fs::create_dir_all(paths.root()).context("Failed to create .coven directory")?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file())
        .context("Failed to open daemon log")?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = match &cli.workspace {
        Some(workspace) => workspace.clone(),
        None => std::env::current_dir().context("Failed to resolve working directory")?,
    };
    let paths = CovenPaths::new(&workspace);
    let manager = DaemonManager::new(paths.pid_file());

    match cli.command {
        Command::Start { foreground } => {
            if foreground {
                setup_stderr_logging();
                manager.register_self()?;
                let result = run_daemon(workspace, paths.clone(), cli.config).await;
                manager.remove_pid_file();
                result
            } else {
                let pid = manager.start(&workspace)?;
                println!("covend started (pid {pid})");
                Ok(())
            }
        }

        Command::Stop => {
            setup_stderr_logging();
            manager.stop()?;
            println!("covend stopped");
            Ok(())
        }

        Command::Status => {
            let Some(pid) = manager.running_pid() else {
                println!("covend not running");
                return Ok(());
            };
            println!("covend running (pid {pid}, workspace {})", workspace.display());

            // The daemon answers over its socket with richer detail
            let client = DaemonClient::new(paths.socket());
            match client.get("/health").await {
                Ok(response) if response.is_success() => {
                    let health = &response.body;
                    println!("  version: {}", health["version"].as_str().unwrap_or("unknown"));
                    println!("  uptime: {}s", health["uptime"].as_u64().unwrap_or(0));
                }
                _ => println!("  socket not responding"),
            }
            Ok(())
        }

        Command::Logs { lines } => {
            let log_path = paths.log_file();
            let content = std::fs::read_to_string(&log_path)
                .with_context(|| format!("Failed to read {}", log_path.display()))?;
            let all: Vec<&str> = content.lines().collect();
            for line in all.iter().skip(all.len().saturating_sub(lines)) {
                println!("{line}");
            }
            Ok(())
        }

        Command::RunDaemon => {
            setup_file_logging(&paths)?;
            manager.register_self()?;
            let result = run_daemon(workspace, paths.clone(), cli.config).await;
            manager.remove_pid_file();
            result
        }
    }
}

/// Wire the components together and serve until a termination signal
async fn run_daemon(workspace: PathBuf, paths: CovenPaths, config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(&workspace, config_path.as_ref()).context("Failed to load configuration")?;
    paths.ensure_dirs().context("Failed to create workspace layout")?;

    info!(
        workspace = %workspace.display(),
        max_agents = config.scheduler.max_agents,
        agent_command = %config.agent.command,
        "covend starting"
    );

    let bus = Arc::new(EventBus::default());
    let store = Arc::new(StateStore::new(bus.clone()));
    let persister = WorkflowPersister::new(paths.workflow_dir());
    let worktrees = WorktreeManager::new(
        workspace.clone(),
        paths.worktree_dir(),
        config.git.branch_prefix.clone(),
        config.git.base_branch.clone(),
    );
    let library = Arc::new(
        Library::load(&paths.grimoire_dir(), config.grimoires.clone()).context("Failed to load grimoires")?,
    );
    let spells = Arc::new(SpellLoader::new(paths.spell_dir()));
    let answers = AnswerRouter::new();
    let agent_runner = Arc::new(CommandAgentRunner::new(
        config.agent.command.clone(),
        bus.clone(),
        store.clone(),
        answers.clone(),
        paths.output_dir(),
    ));
    let task_store = Arc::new(BeadsCli::new(workspace.clone()));

    let scheduler = Scheduler::new(
        &config,
        SchedulerDeps {
            store: store.clone(),
            bus: bus.clone(),
            task_store,
            worktrees,
            persister: persister.clone(),
            agent_runner,
            spells,
            library,
            output_dir: paths.output_dir(),
        },
    );

    scheduler.recover().await;
    scheduler.start().await;

    let heartbeat = api::spawn_snapshot_heartbeat(store.clone(), bus.clone(), config.scheduler.snapshot_interval());

    let state = AppState {
        store,
        bus,
        scheduler: scheduler.clone(),
        persister,
        answers,
        paths: paths.clone(),
        started_at: Instant::now(),
    };

    let socket_path = paths.socket();
    let serve_result = api::serve(state, &socket_path, shutdown_signal()).await;

    info!("Shutting down");
    scheduler.stop().await;
    heartbeat.abort();
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            warn!(error = %e, "Failed to remove socket file");
        }
    }
    serve_result
}

/// Resolve on SIGTERM or SIGINT
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
