//! Scheduler implementation.
//!
//! One long-lived reconcile loop (default every 5s) plus a low-frequency
//! cleanup loop (default hourly). Each reconcile tick retries pending
//! resumes, refreshes the bead cache from the task store, and fills free
//! agent slots with ready beads: worktree first, optimistic status push,
//! then a workflow task. Environmental failures get exactly one retry at
//! the next tick before the bead is blocked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentRunner;
use crate::beads::TaskStore;
use crate::config::Config;
use crate::domain::{AgentRecord, AgentStatus, Bead, BeadStatus};
use crate::events::EventBus;
use crate::grimoire::Library;
use crate::spell::SpellLoader;
use crate::state::StateStore;
use crate::workflow::{
    MergeDecision, MergeGates, WorkflowConfig, WorkflowPersister, WorkflowResult, WorkflowRunner, WorkflowState,
    WorkflowStatus,
};
use crate::worktree::{merge_to_main, MergeOutcome, WorktreeInfo, WorktreeManager};

/// What an approve request produced
#[derive(Debug, Clone)]
pub enum ApproveOutcome {
    /// Merge landed; the workflow resumes from the next step
    Merged { commit: String },
    /// Conflicts; the workflow stays in pending_merge for a retry
    Conflicts { files: Vec<String> },
}

/// Why an approve/reject request was refused
#[derive(Debug, thiserror::Error)]
pub enum ApproveError {
    #[error("no workflow for {0}")]
    NotFound(String),

    #[error("workflow for {0} is not pending merge")]
    NotPendingMerge(String),

    #[error("{0}")]
    Environment(String),
}

/// External collaborators the scheduler drives
pub struct SchedulerDeps {
    pub store: Arc<StateStore>,
    pub bus: Arc<EventBus>,
    pub task_store: Arc<dyn TaskStore>,
    pub worktrees: WorktreeManager,
    pub persister: WorkflowPersister,
    pub agent_runner: Arc<dyn AgentRunner>,
    pub spells: Arc<SpellLoader>,
    pub library: Arc<Library>,
    pub output_dir: std::path::PathBuf,
}

/// Volatile configuration and bookkeeping, one mutex for all of it
struct Inner {
    max_agents: usize,
    reconcile_interval: Duration,
    cleanup_interval: Duration,
    agent_timeout_ms: u64,
    script_timeout_ms: u64,

    /// Interrupted workflows whose bead has not reappeared yet
    pending_resumes: HashMap<String, WorkflowState>,

    /// Environmental failure counts per bead (one retry, then blocked)
    env_failures: HashMap<String, u32>,

    /// Cancellation token per in-flight workflow
    cancel_tokens: HashMap<String, CancellationToken>,

    /// Join handles of in-flight workflow tasks
    workflows: HashMap<String, JoinHandle<()>>,

    /// Loop control; present while started
    stop_tx: Option<watch::Sender<bool>>,
    loops: Vec<JoinHandle<()>>,
}

/// The reconciliation scheduler
pub struct Scheduler {
    deps: SchedulerDeps,
    merge_gates: MergeGates,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(config: &Config, deps: SchedulerDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            merge_gates: MergeGates::new(),
            inner: Mutex::new(Inner {
                max_agents: config.scheduler.max_agents,
                reconcile_interval: config.scheduler.reconcile_interval(),
                cleanup_interval: config.scheduler.cleanup_interval(),
                agent_timeout_ms: config.agent.timeout_ms,
                script_timeout_ms: config.workflow.script_timeout_ms,
                pending_resumes: HashMap::new(),
                env_failures: HashMap::new(),
                cancel_tokens: HashMap::new(),
                workflows: HashMap::new(),
                stop_tx: None,
                loops: Vec::new(),
            }),
        })
    }

    pub fn merge_gates(&self) -> &MergeGates {
        &self.merge_gates
    }

    /// Adjust the concurrency cap at runtime
    pub async fn set_max_agents(&self, max_agents: usize) {
        self.inner.lock().await.max_agents = max_agents;
    }

    /// Load interrupted workflows into the pending-resumes queue.
    ///
    /// Called once at startup, before `start`.
    pub async fn recover(self: &Arc<Self>) {
        let interrupted = match self.deps.persister.list_interrupted() {
            Ok(interrupted) => interrupted,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate interrupted workflows");
                return;
            }
        };
        if interrupted.is_empty() {
            return;
        }
        info!(count = interrupted.len(), "Queued interrupted workflows for resume");
        let mut inner = self.inner.lock().await;
        for state in interrupted {
            inner.pending_resumes.insert(state.task_id.clone(), state);
        }
    }

    /// Start the reconcile and cleanup loops; a second start is a no-op
    pub async fn start(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.stop_tx.is_some() {
            debug!("Scheduler already started");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let reconcile_interval = inner.reconcile_interval;
        let cleanup_interval = inner.cleanup_interval;

        let scheduler = self.clone();
        let mut rx = stop_rx.clone();
        let reconcile_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.reconcile().await,
                    _ = rx.changed() => break,
                }
            }
            debug!("Reconcile loop stopped");
        });

        let scheduler = self.clone();
        let mut rx = stop_rx;
        let cleanup_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of tokio's interval fires immediately; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.cleanup().await,
                    _ = rx.changed() => break,
                }
            }
            debug!("Cleanup loop stopped");
        });

        inner.stop_tx = Some(stop_tx);
        inner.loops = vec![reconcile_loop, cleanup_loop];
        info!("Scheduler started");
    }

    /// Stop the loops, cancel in-flight workflows, and wait for all of
    /// them; a second stop is a no-op
    pub async fn stop(&self) {
        let (stop_tx, loops, tokens, handles) = {
            let mut inner = self.inner.lock().await;
            let Some(stop_tx) = inner.stop_tx.take() else {
                debug!("Scheduler already stopped");
                return;
            };
            (
                stop_tx,
                std::mem::take(&mut inner.loops),
                inner.cancel_tokens.drain().collect::<Vec<_>>(),
                std::mem::take(&mut inner.workflows),
            )
        };

        let _ = stop_tx.send(true);
        for handle in loops {
            let _ = handle.await;
        }

        for (task_id, token) in tokens {
            debug!(%task_id, "Cancelling in-flight workflow");
            token.cancel();
        }
        for (task_id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(%task_id, error = %e, "Workflow task join failed");
            }
        }
        info!("Scheduler stopped");
    }

    /// One reconciliation pass
    pub async fn reconcile(self: &Arc<Self>) {
        self.process_pending_resumes().await;
        self.reconcile_pending_merges().await;

        // Free slots under the cap
        let max_agents = self.inner.lock().await.max_agents;
        let running = self.deps.store.list_running_agents().len();
        let slots = max_agents.saturating_sub(running);
        debug!(running, max_agents, slots, "Reconcile tick");

        // Refresh the bead cache even when no slots are free, so the API
        // and clients keep seeing fresh task state
        let ready = match self.deps.task_store.list_ready().await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "Task store unavailable, skipping tick");
                return;
            }
        };
        self.deps.store.sync_tasks(ready.clone());

        if slots == 0 {
            return;
        }

        let mut launched = 0;
        for bead in ready {
            if launched >= slots {
                break;
            }
            if self.is_busy(&bead.id).await {
                continue;
            }
            if self.launch(bead).await {
                launched += 1;
            }
        }
    }

    /// A bead with a live agent, parked merge, or queued resume is busy
    async fn is_busy(&self, task_id: &str) -> bool {
        if self
            .deps
            .store
            .get_agent(task_id)
            .is_some_and(|a| a.status.is_active())
        {
            return true;
        }
        if self.merge_gates.is_parked(task_id) {
            return true;
        }
        let inner = self.inner.lock().await;
        inner.pending_resumes.contains_key(task_id) || inner.workflows.contains_key(task_id)
    }

    /// Retry queued resumes whose bead has appeared in the task store
    async fn process_pending_resumes(self: &Arc<Self>) {
        let queued: Vec<(String, WorkflowState)> = {
            let inner = self.inner.lock().await;
            inner
                .pending_resumes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        for (task_id, state) in queued {
            let bead = match self.deps.task_store.get(&task_id).await {
                Ok(Some(bead)) => bead,
                Ok(None) => {
                    debug!(%task_id, "Resume still waiting for bead to appear");
                    continue;
                }
                Err(e) => {
                    warn!(%task_id, error = %e, "Task store lookup failed for resume");
                    continue;
                }
            };

            self.inner.lock().await.pending_resumes.remove(&task_id);
            self.deps.store.sync_tasks(vec![bead.clone()]);
            info!(%task_id, step = state.current_step, "Resuming interrupted workflow");

            let worktree = WorktreeInfo {
                task_id: task_id.clone(),
                path: state.worktree_path.clone(),
                branch: state.branch.clone(),
            };
            self.spawn_workflow(bead, worktree, Some(state)).await;
        }
    }

    /// Keep the external store's poorer vocabulary in sync with parked
    /// merges: pending_merge shows as blocked outside
    async fn reconcile_pending_merges(&self) {
        for workflow in self.deps.store.get_workflows() {
            if workflow.status != WorkflowStatus::PendingMerge {
                continue;
            }
            let cached = self.deps.store.get_task(&workflow.task_id);
            if cached.is_some_and(|b| b.status != BeadStatus::Blocked) {
                self.push_task_status(&workflow.task_id, BeadStatus::Blocked).await;
            }
        }
    }

    /// Acquire a worktree and launch a workflow for a ready bead.
    /// Returns true when a workflow was actually started.
    async fn launch(self: &Arc<Self>, bead: Bead) -> bool {
        let task_id = bead.id.clone();

        let worktree = match self.deps.worktrees.create(&task_id).await {
            Ok(worktree) => worktree,
            Err(e) => {
                self.note_env_failure(&task_id, &format!("worktree creation failed: {e}")).await;
                return false;
            }
        };

        // Optimistic local transition, then the external push; unwind the
        // worktree when the push fails
        self.deps.store.sync_tasks(vec![bead.clone()]);
        self.deps.store.update_task_status(&task_id, BeadStatus::InProgress);
        if let Err(e) = self
            .deps
            .task_store
            .update_status(&task_id, BeadStatus::InProgress)
            .await
        {
            warn!(%task_id, error = %e, "Status push failed, releasing worktree");
            self.deps.store.update_task_status(&task_id, BeadStatus::Open);
            if let Err(e) = self.deps.worktrees.remove(&task_id).await {
                warn!(%task_id, error = %e, "Failed to remove worktree after push failure");
            }
            self.deps.worktrees.delete_branch(&worktree.branch).await;
            self.note_env_failure(&task_id, &format!("task store push failed: {e}")).await;
            return false;
        }

        self.inner.lock().await.env_failures.remove(&task_id);

        let record = AgentRecord::new(&task_id, worktree.path.clone(), &worktree.branch);
        self.deps.store.add_agent(record);
        self.deps.store.update_agent_status(&task_id, AgentStatus::Running);

        self.spawn_workflow(bead, worktree, None).await;
        true
    }

    /// Spawn the workflow task for a bead (fresh or resumed)
    async fn spawn_workflow(self: &Arc<Self>, bead: Bead, worktree: WorktreeInfo, resume: Option<WorkflowState>) {
        let task_id = bead.id.clone();

        let grimoire = match self.deps.library.resolve(&bead) {
            Ok(grimoire) => grimoire.clone(),
            Err(e) => {
                warn!(%task_id, error = %e, "No grimoire for bead");
                self.deps.store.set_agent_error(&task_id, e.to_string());
                self.deps.store.update_agent_status(&task_id, AgentStatus::Failed);
                self.push_task_status(&task_id, BeadStatus::Blocked).await;
                return;
            }
        };

        // Resumed runs may predate the current agent record set
        if self.deps.store.get_agent(&task_id).is_none() {
            let record = AgentRecord::new(&task_id, worktree.path.clone(), &worktree.branch);
            self.deps.store.add_agent(record);
            self.deps.store.update_agent_status(&task_id, AgentStatus::Running);
        }

        let cancel = CancellationToken::new();
        let (agent_timeout_ms, script_timeout_ms) = {
            let mut inner = self.inner.lock().await;
            inner.cancel_tokens.insert(task_id.clone(), cancel.clone());
            (inner.agent_timeout_ms, inner.script_timeout_ms)
        };

        let config = WorkflowConfig {
            bead,
            grimoire,
            agent_runner: self.deps.agent_runner.clone(),
            spells: self.deps.spells.clone(),
            persister: self.deps.persister.clone(),
            bus: self.deps.bus.clone(),
            store: self.deps.store.clone(),
            worktrees: self.deps.worktrees.clone(),
            merge_gates: self.merge_gates.clone(),
            agent_timeout_ms,
            script_timeout_ms,
        };

        let runner = match resume {
            Some(state) => WorkflowRunner::resume(config, state, cancel),
            None => WorkflowRunner::new(config, &worktree, cancel),
        };

        let scheduler = self.clone();
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            let result = runner.run().await;
            scheduler.finish_workflow(&id, result).await;
        });
        self.inner.lock().await.workflows.insert(task_id, handle);
    }

    /// Map a terminal workflow status onto agent and task state
    async fn finish_workflow(&self, task_id: &str, result: WorkflowResult) {
        debug!(%task_id, status = %result.status, "Workflow task finished");

        if let Some(error) = &result.error {
            self.deps.store.set_agent_error(task_id, error.clone());
        }
        let agent_status = match result.status {
            WorkflowStatus::Completed | WorkflowStatus::Blocked | WorkflowStatus::PendingMerge => AgentStatus::Completed,
            WorkflowStatus::Failed => AgentStatus::Failed,
            WorkflowStatus::Cancelled => AgentStatus::Killed,
            WorkflowStatus::Running => AgentStatus::Failed,
        };
        self.deps.store.update_agent_status(task_id, agent_status);

        let bead_status = match result.status {
            WorkflowStatus::Completed => BeadStatus::Closed,
            WorkflowStatus::Cancelled => BeadStatus::Open,
            WorkflowStatus::PendingMerge
            | WorkflowStatus::Blocked
            | WorkflowStatus::Failed
            | WorkflowStatus::Running => BeadStatus::Blocked,
        };
        self.push_task_status(task_id, bead_status).await;

        // A killed run releases its worktree immediately
        if result.status == WorkflowStatus::Cancelled {
            if let Err(e) = self.deps.worktrees.remove(task_id).await {
                warn!(%task_id, error = %e, "Failed to remove worktree after cancellation");
            } else {
                self.deps.worktrees.delete_branch(&self.deps.worktrees.branch_for(task_id)).await;
            }
        }

        let mut inner = self.inner.lock().await;
        inner.cancel_tokens.remove(task_id);
        inner.workflows.remove(task_id);
    }

    /// Update the cache and push the same status to the external store
    async fn push_task_status(&self, task_id: &str, status: BeadStatus) {
        self.deps.store.update_task_status(task_id, status);
        if let Err(e) = self.deps.task_store.update_status(task_id, status).await {
            warn!(%task_id, %status, error = %e, "Failed to push task status to store");
        }
    }

    /// Record an environmental failure; the second one blocks the bead
    async fn note_env_failure(&self, task_id: &str, error: &str) {
        let failures = {
            let mut inner = self.inner.lock().await;
            let count = inner.env_failures.entry(task_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if failures < 2 {
            warn!(%task_id, %error, "Environmental failure, will retry next tick");
            return;
        }

        warn!(%task_id, %error, "Environmental failure repeated, blocking bead");
        self.inner.lock().await.env_failures.remove(task_id);
        self.deps.store.set_agent_error(task_id, error);
        self.push_task_status(task_id, BeadStatus::Blocked).await;
    }

    /// Manually start a specific bead, outside the ready-queue order
    pub async fn start_task(self: &Arc<Self>, task_id: &str) -> Result<(), ApproveError> {
        if self.is_busy(task_id).await {
            return Err(ApproveError::NotPendingMerge(format!("{task_id} already has a running agent")));
        }
        let bead = self
            .deps
            .task_store
            .get(task_id)
            .await
            .map_err(|e| ApproveError::Environment(e.to_string()))?
            .ok_or_else(|| ApproveError::NotFound(task_id.to_string()))?;
        if !self.launch(bead).await {
            return Err(ApproveError::Environment(format!("failed to launch workflow for {task_id}")));
        }
        Ok(())
    }

    /// Cancel a bead's running workflow; false when nothing is running
    pub async fn kill_agent(&self, task_id: &str) -> bool {
        let token = self.inner.lock().await.cancel_tokens.get(task_id).cloned();
        match token {
            Some(token) => {
                info!(%task_id, "Killing agent");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drive a parked merge forward: commit, merge, free the worktree, and
    /// let the runner continue; conflicts keep the workflow parked
    pub async fn approve_merge(&self, task_id: &str, feedback: Option<String>) -> Result<ApproveOutcome, ApproveError> {
        let mut state = self
            .deps
            .persister
            .load(task_id)
            .map_err(|e| ApproveError::Environment(e.to_string()))?
            .ok_or_else(|| ApproveError::NotFound(task_id.to_string()))?;

        if state.status != WorkflowStatus::PendingMerge {
            return Err(ApproveError::NotPendingMerge(task_id.to_string()));
        }

        self.deps
            .worktrees
            .commit_worktree(&state.worktree_path)
            .await
            .map_err(|e| ApproveError::Environment(e.to_string()))?;

        let base = self
            .deps
            .worktrees
            .base_branch()
            .await
            .map_err(|e| ApproveError::Environment(e.to_string()))?;

        let outcome = merge_to_main(self.deps.worktrees.repo_path(), &state.branch, &base)
            .await
            .map_err(|e| ApproveError::Environment(e.to_string()))?;

        match outcome {
            MergeOutcome::Conflicts { files } => {
                info!(%task_id, ?files, "Merge approval hit conflicts, staying pending");
                Ok(ApproveOutcome::Conflicts { files })
            }
            MergeOutcome::Merged { commit } => {
                if let Err(e) = self.deps.worktrees.remove(task_id).await {
                    warn!(%task_id, error = %e, "Failed to remove worktree after merge");
                }
                self.deps.worktrees.delete_branch(&state.branch).await;

                // Persist the advance past the merge step so a crash between
                // approval and resume cannot replay the merge
                state.current_step += 1;
                state.status = WorkflowStatus::Running;
                if let Err(e) = self.deps.persister.save(&state) {
                    warn!(%task_id, error = %e, "Failed to persist approved workflow state");
                }
                self.deps.store.upsert_workflow(state);

                if !self
                    .merge_gates
                    .signal(task_id, MergeDecision::Approved { feedback })
                {
                    debug!(%task_id, "No parked runner; resume will pick up from the next step");
                }
                Ok(ApproveOutcome::Merged { commit })
            }
        }
    }

    /// Reject a parked merge: block the workflow, keep the worktree
    pub async fn reject_merge(&self, task_id: &str, reason: Option<String>) -> Result<(), ApproveError> {
        let mut state = self
            .deps
            .persister
            .load(task_id)
            .map_err(|e| ApproveError::Environment(e.to_string()))?
            .ok_or_else(|| ApproveError::NotFound(task_id.to_string()))?;

        if state.status != WorkflowStatus::PendingMerge {
            return Err(ApproveError::NotPendingMerge(task_id.to_string()));
        }

        let reason = reason.unwrap_or_else(|| "merge rejected".to_string());
        info!(%task_id, %reason, "Merge rejected");

        if !self.merge_gates.signal(
            task_id,
            MergeDecision::Rejected { reason: reason.clone() },
        ) {
            // No live runner: persist the block directly
            state.status = WorkflowStatus::Blocked;
            state.error = Some(reason.clone());
            if let Err(e) = self.deps.persister.save(&state) {
                warn!(%task_id, error = %e, "Failed to persist rejected workflow state");
            }
            self.deps.store.upsert_workflow(state);
        }

        self.push_task_status(task_id, BeadStatus::Blocked).await;
        Ok(())
    }

    /// Garbage-collect orphan worktrees and stale output logs
    pub async fn cleanup(&self) {
        let mut active: Vec<String> = self
            .deps
            .store
            .list_running_agents()
            .into_iter()
            .map(|a| a.task_id)
            .collect();
        match self.deps.persister.list_interrupted() {
            Ok(states) => active.extend(states.into_iter().map(|s| s.task_id)),
            Err(e) => {
                warn!(error = %e, "Skipping cleanup, cannot enumerate workflow states");
                return;
            }
        }
        {
            let inner = self.inner.lock().await;
            active.extend(inner.pending_resumes.keys().cloned());
            active.extend(inner.workflows.keys().cloned());
        }

        match self.deps.worktrees.cleanup_orphaned(&active).await {
            Ok(0) => {}
            Ok(cleaned) => info!(cleaned, "Removed orphaned worktrees"),
            Err(e) => warn!(error = %e, "Worktree cleanup failed"),
        }

        self.cleanup_stale_outputs(&active).await;
    }

    /// Delete output logs for inactive beads untouched for a week
    async fn cleanup_stale_outputs(&self, active: &[String]) {
        const STALE_AFTER: Duration = Duration::from_secs(7 * 24 * 3600);

        let Ok(mut entries) = tokio::fs::read_dir(&self.deps.output_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let task_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if active.contains(&task_id) {
                continue;
            }
            let stale = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                .is_some_and(|age| age > STALE_AFTER);
            if stale {
                debug!(path = %path.display(), "Removing stale output log");
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }
}
