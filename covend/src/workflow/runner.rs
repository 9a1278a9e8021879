//! Workflow runner - the recursive interpreter over a grimoire's steps.
//!
//! Each top-level step is gated by `when`, dispatched to its executor,
//! reflected into `previous.*`, persisted, and reported on the event bus.
//! Loops execute their children with a per-iteration context overlay; merge
//! steps either auto-merge or park the run in `pending_merge` until the
//! scheduler signals the per-task merge gate.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentRunner;
use crate::domain::Bead;
use crate::events::{truncate_output, Event, EventBus};
use crate::grimoire::{Grimoire, StepDef, StepKind};
use crate::spell::SpellLoader;
use crate::state::StateStore;
use crate::worktree::{merge_to_main, MergeOutcome, WorktreeInfo, WorktreeManager};

use super::context::VariableContext;
use super::persist::{WorkflowPersister, WorkflowState, WorkflowStatus};
use super::result::{StepAction, StepOutcome, StepResult};
use super::{run_agent, run_script};

/// Verdict delivered through a merge gate
#[derive(Debug, Clone)]
pub enum MergeDecision {
    /// Merge done, worktree freed; continue from the next step
    Approved { feedback: Option<String> },
    /// Review rejected; the workflow blocks with this reason
    Rejected { reason: String },
}

/// Per-task channels connecting parked runners to the scheduler's
/// approve/reject handlers
#[derive(Clone, Default)]
pub struct MergeGates {
    inner: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<MergeDecision>>>>,
}

impl MergeGates {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, task_id: &str) -> mpsc::UnboundedReceiver<MergeDecision> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_id.to_string(), tx);
        rx
    }

    fn unregister(&self, task_id: &str) {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).remove(task_id);
    }

    /// Whether a runner is parked on this task's gate
    pub fn is_parked(&self, task_id: &str) -> bool {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).contains_key(task_id)
    }

    /// Deliver a decision to a parked runner; false when nobody waits
    pub fn signal(&self, task_id: &str, decision: MergeDecision) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.get(task_id) {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }
}

/// Terminal outcome of a workflow run
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub status: WorkflowStatus,
    pub error: Option<String>,
}

/// Everything a runner needs besides the run state itself
pub struct WorkflowConfig {
    pub bead: Bead,
    pub grimoire: Grimoire,
    pub agent_runner: Arc<dyn AgentRunner>,
    pub spells: Arc<SpellLoader>,
    pub persister: WorkflowPersister,
    pub bus: Arc<EventBus>,
    pub store: Arc<StateStore>,
    pub worktrees: WorktreeManager,
    pub merge_gates: MergeGates,
    pub agent_timeout_ms: u64,
    pub script_timeout_ms: u64,
}

/// Interpreter for one bead's grimoire run
pub struct WorkflowRunner {
    config: WorkflowConfig,
    state: WorkflowState,
    ctx: VariableContext,
    cancel: CancellationToken,
    resumed: bool,
}

impl WorkflowRunner {
    /// Fresh run against a newly created worktree
    pub fn new(config: WorkflowConfig, worktree: &WorktreeInfo, cancel: CancellationToken) -> Self {
        let state = WorkflowState::new(
            &config.bead.id,
            &config.grimoire.name,
            worktree.path.clone(),
            &worktree.branch,
        );
        let mut ctx = VariableContext::new();
        ctx.bind_bead(&config.bead);
        Self {
            config,
            state,
            ctx,
            cancel,
            resumed: false,
        }
    }

    /// Resume a persisted run at its saved step with rehydrated variables
    pub fn resume(config: WorkflowConfig, state: WorkflowState, cancel: CancellationToken) -> Self {
        let mut ctx = VariableContext::from_map(state.variables.clone());
        // Rebind in case the bead changed while we were down
        ctx.bind_bead(&config.bead);
        Self {
            config,
            state,
            ctx,
            cancel,
            resumed: true,
        }
    }

    /// The run's identity, available before `run` consumes the runner
    pub fn workflow_id(&self) -> &str {
        &self.state.workflow_id
    }

    /// Execute to a terminal status
    pub async fn run(mut self) -> WorkflowResult {
        info!(
            workflow_id = %self.state.workflow_id,
            task_id = %self.state.task_id,
            grimoire = %self.state.grimoire,
            resumed = self.resumed,
            start_step = self.state.current_step,
            "Workflow starting"
        );

        self.config.bus.emit(Event::WorkflowStarted {
            workflow_id: self.state.workflow_id.clone(),
            task_id: self.state.task_id.clone(),
            grimoire: self.state.grimoire.clone(),
        });
        self.state.status = WorkflowStatus::Running;
        self.persist();

        let steps = self.config.grimoire.steps.clone();

        while self.state.current_step < steps.len() {
            if self.cancel.is_cancelled() {
                return self.finish(WorkflowStatus::Cancelled, None);
            }

            let index = self.state.current_step;
            let step = &steps[index];

            // Review merges park at the top level; everything else goes
            // through the generic step path
            if let StepKind::Merge { require_review: true } = step.kind {
                match self.run_review_merge(step, index).await {
                    ReviewFlow::Continue => continue,
                    ReviewFlow::Finished(result) => return result,
                }
            }

            let outcome = self.run_step(step, index).await;
            let result = match outcome {
                StepOutcome::Completed(result) => result,
                StepOutcome::Cancelled => return self.finish(WorkflowStatus::Cancelled, None),
            };

            match result.action {
                StepAction::Continue | StepAction::ExitLoop => {
                    // `exit_loop` at the top level degrades to continue
                    self.state.current_step = index + 1;
                    self.persist();
                }
                StepAction::Fail => {
                    let error = result.error.clone().unwrap_or_else(|| "step failed".to_string());
                    return self.finish(WorkflowStatus::Failed, Some(error));
                }
                StepAction::Block => {
                    let error = result.error.clone().unwrap_or_else(|| "step blocked".to_string());
                    return self.finish(WorkflowStatus::Blocked, Some(error));
                }
            }
        }

        self.finish(WorkflowStatus::Completed, None)
    }

    /// Run one step (any nesting level): `when` gate, dispatch, bindings,
    /// events, persistence
    fn run_step<'a>(
        &'a mut self,
        step: &'a StepDef,
        index: usize,
    ) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>> {
        Box::pin(async move {
            // `when` gate
            if let Some(when) = &step.when {
                match self.ctx.evaluate_when(when) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(step = %step.name, "Step skipped by when guard");
                        self.ctx.bind_previous(true, "");
                        self.config.bus.emit(Event::StepSkipped {
                            workflow_id: self.state.workflow_id.clone(),
                            task_id: self.state.task_id.clone(),
                            step: step.name.clone(),
                            index,
                        });
                        return StepOutcome::Completed(StepResult::success("", Duration::ZERO));
                    }
                    Err(e) => {
                        return StepOutcome::Completed(StepResult::failure(
                            String::new(),
                            -1,
                            Duration::ZERO,
                            format!("failed to evaluate when guard: {e}"),
                            StepAction::Fail,
                        ));
                    }
                }
            }

            self.config.bus.emit(Event::StepStarted {
                workflow_id: self.state.workflow_id.clone(),
                task_id: self.state.task_id.clone(),
                step: step.name.clone(),
                kind: step.kind_name().to_string(),
                index,
            });

            let timeout = step.timeout(self.config.agent_timeout_ms, self.config.script_timeout_ms);
            let outcome = match &step.kind {
                StepKind::Script {
                    command,
                    on_fail,
                    on_success,
                } => {
                    let outcome = run_script(
                        command,
                        *on_fail,
                        *on_success,
                        &self.ctx,
                        &self.state.worktree_path,
                        timeout,
                        &self.cancel,
                    )
                    .await;
                    if let StepOutcome::Completed(result) = &outcome {
                        if let Some(name) = &step.output {
                            self.ctx.set(name.clone(), Value::String(result.output.clone()));
                        }
                    }
                    outcome
                }

                StepKind::Agent { spell, content, input } => {
                    let agent_outcome = run_agent(
                        &self.state.task_id,
                        spell.as_deref(),
                        content.as_deref(),
                        input,
                        &self.ctx,
                        &self.config.spells,
                        &self.config.agent_runner,
                        &self.state.worktree_path,
                        timeout,
                        &self.cancel,
                    )
                    .await;

                    if let Some(exit_code) = agent_outcome.exit_code {
                        self.config.store.set_agent_exit_code(&self.state.task_id, exit_code);
                    }
                    if let StepOutcome::Completed(result) = &agent_outcome.outcome {
                        if result.success {
                            if let (Some(name), Some(parsed)) = (&step.output, &agent_outcome.parsed) {
                                self.ctx.set(name.clone(), parsed.to_value());
                            }
                        }
                    }
                    agent_outcome.outcome
                }

                StepKind::Loop {
                    steps,
                    max_iterations,
                    on_max_iterations,
                } => self.run_loop(steps, *max_iterations, *on_max_iterations).await,

                // Top-level review merges are intercepted in `run`; one
                // nested in a loop cannot park durably, so it blocks
                StepKind::Merge { require_review: true } => StepOutcome::Completed(StepResult::failure(
                    String::new(),
                    -1,
                    Duration::ZERO,
                    "merge steps with require-review must be top-level steps".to_string(),
                    StepAction::Block,
                )),
                StepKind::Merge { require_review: false } => self.run_auto_merge().await,
            };

            if let StepOutcome::Completed(result) = &outcome {
                self.ctx.bind_previous(result.success, &result.output);
                // Durable state first, then the observable event
                self.persist();
                self.emit_step_result(step, index, result);
            }
            outcome
        })
    }

    /// Execute a loop's children repeatedly with `loop_entry` restoration
    async fn run_loop(
        &mut self,
        steps: &[StepDef],
        max_iterations: u32,
        on_max: crate::grimoire::OnMaxIterations,
    ) -> StepOutcome {
        use crate::grimoire::OnMaxIterations;

        let started = Instant::now();
        if max_iterations == 0 {
            return StepOutcome::Completed(StepResult::success("loop ran zero iterations", started.elapsed()));
        }

        let entry = self.ctx.snapshot();

        for iteration in 1..=max_iterations {
            // Each iteration starts from the loop-entry context; nothing a
            // prior iteration bound survives except through loop_entry
            self.ctx.restore(&entry);
            self.ctx.bind_loop_iteration(&entry, iteration);
            debug!(iteration, max_iterations, "Loop iteration starting");

            for (child_index, child) in steps.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return StepOutcome::Cancelled;
                }

                let outcome = self.run_step(child, child_index).await;
                let result = match outcome {
                    StepOutcome::Completed(result) => result,
                    StepOutcome::Cancelled => return StepOutcome::Cancelled,
                };

                match result.action {
                    StepAction::Continue => {}
                    StepAction::ExitLoop => {
                        debug!(iteration, step = %child.name, "Loop exited");
                        return StepOutcome::Completed(StepResult::success(
                            format!("loop exited at iteration {iteration}"),
                            started.elapsed(),
                        ));
                    }
                    StepAction::Fail => {
                        return StepOutcome::Completed(StepResult {
                            action: StepAction::Fail,
                            duration: started.elapsed(),
                            ..result
                        });
                    }
                    StepAction::Block => {
                        return StepOutcome::Completed(StepResult {
                            action: StepAction::Block,
                            duration: started.elapsed(),
                            ..result
                        });
                    }
                }
            }
        }

        match on_max {
            OnMaxIterations::Block => StepOutcome::Completed(StepResult::failure(
                String::new(),
                -1,
                started.elapsed(),
                format!("loop reached max iterations ({max_iterations})"),
                StepAction::Block,
            )),
            OnMaxIterations::Exit | OnMaxIterations::Continue => StepOutcome::Completed(StepResult::success(
                format!("loop reached max iterations ({max_iterations})"),
                started.elapsed(),
            )),
        }
    }

    /// Merge without review: commit, merge, free the worktree
    async fn run_auto_merge(&mut self) -> StepOutcome {
        let started = Instant::now();

        if let Err(e) = self.config.worktrees.commit_worktree(&self.state.worktree_path).await {
            return StepOutcome::Completed(StepResult::failure(
                String::new(),
                -1,
                started.elapsed(),
                format!("failed to commit worktree: {e}"),
                StepAction::Fail,
            ));
        }

        let base = match self.config.worktrees.base_branch().await {
            Ok(base) => base,
            Err(e) => {
                return StepOutcome::Completed(StepResult::failure(
                    String::new(),
                    -1,
                    started.elapsed(),
                    format!("failed to resolve base branch: {e}"),
                    StepAction::Fail,
                ));
            }
        };

        match merge_to_main(self.config.worktrees.repo_path(), &self.state.branch, &base).await {
            Ok(MergeOutcome::Merged { commit }) => {
                if let Err(e) = self.config.worktrees.remove(&self.state.task_id).await {
                    warn!(task_id = %self.state.task_id, error = %e, "Failed to remove worktree after merge");
                }
                self.config.worktrees.delete_branch(&self.state.branch).await;
                StepOutcome::Completed(StepResult::success(commit, started.elapsed()))
            }
            Ok(MergeOutcome::Conflicts { files }) => StepOutcome::Completed(StepResult::failure(
                files.join("\n"),
                -1,
                started.elapsed(),
                format!("merge conflicts: {}", files.join(", ")),
                StepAction::Block,
            )),
            Err(e) => StepOutcome::Completed(StepResult::failure(
                String::new(),
                -1,
                started.elapsed(),
                format!("merge failed: {e}"),
                StepAction::Fail,
            )),
        }
    }

    /// Merge under review: commit, park in pending_merge, await the gate
    async fn run_review_merge(&mut self, step: &StepDef, index: usize) -> ReviewFlow {
        self.config.bus.emit(Event::StepStarted {
            workflow_id: self.state.workflow_id.clone(),
            task_id: self.state.task_id.clone(),
            step: step.name.clone(),
            kind: "merge".to_string(),
            index,
        });

        if let Err(e) = self.config.worktrees.commit_worktree(&self.state.worktree_path).await {
            let error = format!("failed to commit worktree: {e}");
            return ReviewFlow::Finished(self.finish(WorkflowStatus::Failed, Some(error)));
        }

        info!(task_id = %self.state.task_id, "Workflow parked awaiting merge review");
        self.state.status = WorkflowStatus::PendingMerge;
        self.persist();
        self.config.bus.emit(Event::WorkflowPendingMerge {
            workflow_id: self.state.workflow_id.clone(),
            task_id: self.state.task_id.clone(),
        });
        self.config.bus.emit(Event::StepBlocked {
            workflow_id: self.state.workflow_id.clone(),
            task_id: self.state.task_id.clone(),
            step: step.name.clone(),
            index,
            error: "awaiting merge review".to_string(),
        });

        let mut gate = self.config.merge_gates.register(&self.state.task_id);
        let decision = tokio::select! {
            decision = gate.recv() => decision,
            () = self.cancel.cancelled() => None,
        };
        self.config.merge_gates.unregister(&self.state.task_id);

        match decision {
            Some(MergeDecision::Approved { feedback }) => {
                // The approve handler already merged, freed the worktree,
                // and bumped the persisted index; pick up from the next step
                if let Some(feedback) = feedback {
                    self.ctx.set("review", serde_json::json!({ "feedback": feedback }));
                }
                self.config.bus.emit(Event::StepCompleted {
                    workflow_id: self.state.workflow_id.clone(),
                    task_id: self.state.task_id.clone(),
                    step: step.name.clone(),
                    index,
                    duration_ms: 0,
                    exit_code: 0,
                    output: String::new(),
                });
                self.ctx.bind_previous(true, "");
                self.state.current_step = index + 1;
                self.state.status = WorkflowStatus::Running;
                self.persist();
                ReviewFlow::Continue
            }
            Some(MergeDecision::Rejected { reason }) => {
                ReviewFlow::Finished(self.finish(WorkflowStatus::Blocked, Some(reason)))
            }
            None => ReviewFlow::Finished(self.finish(WorkflowStatus::Cancelled, None)),
        }
    }

    /// Emit the completed/failed/blocked event matching a step result
    fn emit_step_result(&self, step: &StepDef, index: usize, result: &StepResult) {
        let duration_ms = result.duration.as_millis() as u64;
        let event = if result.success {
            Event::StepCompleted {
                workflow_id: self.state.workflow_id.clone(),
                task_id: self.state.task_id.clone(),
                step: step.name.clone(),
                index,
                duration_ms,
                exit_code: result.exit_code,
                output: truncate_output(&result.output),
            }
        } else if result.action == StepAction::Block {
            Event::StepBlocked {
                workflow_id: self.state.workflow_id.clone(),
                task_id: self.state.task_id.clone(),
                step: step.name.clone(),
                index,
                error: result.error.clone().unwrap_or_default(),
            }
        } else {
            Event::StepFailed {
                workflow_id: self.state.workflow_id.clone(),
                task_id: self.state.task_id.clone(),
                step: step.name.clone(),
                index,
                duration_ms,
                exit_code: result.exit_code,
                error: result.error.clone().unwrap_or_default(),
            }
        };
        self.config.bus.emit(event);
    }

    /// Persist the full state (variables + step index + status)
    fn persist(&mut self) {
        self.state.variables = self.ctx.as_map().clone();
        if let Err(e) = self.config.persister.save(&self.state) {
            warn!(task_id = %self.state.task_id, error = %e, "Failed to persist workflow state");
        }
        self.config.store.upsert_workflow(self.state.clone());
    }

    /// Reach a terminal status: persist, clean up, emit
    fn finish(&mut self, status: WorkflowStatus, error: Option<String>) -> WorkflowResult {
        self.state.status = status;
        self.state.error = error.clone();
        self.persist();

        if status == WorkflowStatus::Completed {
            if let Err(e) = self.config.persister.delete(&self.state.task_id) {
                warn!(task_id = %self.state.task_id, error = %e, "Failed to delete completed workflow state");
            }
        }

        let workflow_id = self.state.workflow_id.clone();
        let task_id = self.state.task_id.clone();
        let event = match status {
            WorkflowStatus::Completed => Event::WorkflowCompleted { workflow_id, task_id },
            WorkflowStatus::PendingMerge => Event::WorkflowPendingMerge { workflow_id, task_id },
            WorkflowStatus::Cancelled => Event::WorkflowCancelled { workflow_id, task_id },
            WorkflowStatus::Blocked => Event::WorkflowBlocked {
                workflow_id,
                task_id,
                error: error.clone().unwrap_or_default(),
            },
            WorkflowStatus::Failed | WorkflowStatus::Running => Event::WorkflowFailed {
                workflow_id,
                task_id,
                error: error.clone().unwrap_or_default(),
            },
        };
        self.config.bus.emit(event);

        info!(
            workflow_id = %self.state.workflow_id,
            task_id = %self.state.task_id,
            status = %self.state.status,
            "Workflow finished"
        );
        WorkflowResult { status, error }
    }
}

enum ReviewFlow {
    /// Approved; the main loop continues from the bumped step index
    Continue,
    Finished(WorkflowResult),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentInvocation, AgentRunResult};
    use crate::domain::BeadStatus;
    use crate::grimoire::{OnFail, OnMaxIterations, OnSuccess};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::process::Command;

    /// Agent fake cycling through canned outputs
    struct ScriptedAgent {
        responses: Mutex<Vec<(String, i32)>>,
        calls: AtomicUsize,
    }

    impl ScriptedAgent {
        fn new(responses: Vec<(&str, i32)>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().map(|(o, c)| (o.to_string(), c)).collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedAgent {
        async fn run(&self, _invocation: AgentInvocation) -> eyre::Result<AgentRunResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            let (output, exit_code) = if responses.is_empty() {
                ("{\"success\":true,\"summary\":\"ok\"}".to_string(), 0)
            } else {
                responses.remove(0)
            };
            Ok(AgentRunResult {
                exit_code,
                output,
                timed_out: false,
            })
        }
    }

    async fn setup_git_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
        }
    }

    fn bead(id: &str) -> Bead {
        Bead {
            id: id.to_string(),
            title: "Test bead".to_string(),
            body: String::new(),
            bead_type: "feature".to_string(),
            priority: 1,
            labels: vec![],
            dependencies: vec![],
            status: BeadStatus::Open,
        }
    }

    struct Harness {
        repo: TempDir,
        _state_dir: TempDir,
        bus: Arc<EventBus>,
        store: Arc<StateStore>,
        gates: MergeGates,
        worktrees: WorktreeManager,
        persister: WorkflowPersister,
    }

    impl Harness {
        async fn new() -> Self {
            let repo = TempDir::new().unwrap();
            let state_dir = TempDir::new().unwrap();
            setup_git_repo(repo.path()).await;
            let bus = Arc::new(EventBus::default());
            let store = Arc::new(StateStore::new(bus.clone()));
            let worktrees = WorktreeManager::new(
                repo.path().to_path_buf(),
                state_dir.path().join("worktrees"),
                "coven".to_string(),
                String::new(),
            );
            let persister = WorkflowPersister::new(state_dir.path().join("workflows"));
            Self {
                repo,
                _state_dir: state_dir,
                bus,
                store,
                gates: MergeGates::new(),
                worktrees,
                persister,
            }
        }

        fn config(&self, grimoire: Grimoire, agent: Arc<ScriptedAgent>) -> WorkflowConfig {
            WorkflowConfig {
                bead: bead("bd-1"),
                grimoire,
                agent_runner: agent,
                spells: Arc::new(crate::spell::SpellLoader::inline_only()),
                persister: self.persister.clone(),
                bus: self.bus.clone(),
                store: self.store.clone(),
                worktrees: self.worktrees.clone(),
                merge_gates: self.gates.clone(),
                agent_timeout_ms: 30_000,
                script_timeout_ms: 30_000,
            }
        }

        async fn worktree(&self) -> WorktreeInfo {
            self.worktrees.create("bd-1").await.unwrap()
        }
    }

    fn grimoire_from_yaml(yaml: &str) -> Grimoire {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_script_agent_merge_auto_completes() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![(
            "done\n{\"success\":true,\"summary\":\"done\",\"outputs\":{\"files\":[\"a.txt\"]}}",
            0,
        )]);
        let grimoire = grimoire_from_yaml(
            r#"
name: standard
steps:
  - name: prepare
    type: script
    command: echo hi > a.txt
  - name: implement
    type: agent
    content: "Implement {{bead.title}}"
    output: impl
  - name: merge
    type: merge
    require-review: false
"#,
        );

        let worktree = harness.worktree().await;
        let runner = WorkflowRunner::new(harness.config(grimoire, agent), &worktree, CancellationToken::new());
        let result = runner.run().await;

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert!(result.error.is_none());

        // Merge landed in main and the worktree is gone
        assert!(harness.repo.path().join("a.txt").exists());
        assert!(!worktree.path.exists());

        // Terminal completed runs delete their persisted state
        assert!(harness.persister.load("bd-1").unwrap().is_none());

        // The structured output was bound and persisted into the cache copy
        let workflow = harness.store.get_workflow("bd-1").unwrap();
        assert_eq!(
            workflow.variables["impl"]["outputs"]["files"],
            serde_json::json!(["a.txt"])
        );
    }

    #[tokio::test]
    async fn test_when_guard_skips_and_binds_previous() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        let grimoire = grimoire_from_yaml(
            r#"
name: s
steps:
  - name: never
    type: script
    command: exit 1
    when: "{{.missing}}"
  - name: check
    type: script
    command: echo previous was {{.previous.success}}
    output: check
"#,
        );

        let worktree = harness.worktree().await;
        let runner = WorkflowRunner::new(harness.config(grimoire, agent), &worktree, CancellationToken::new());
        let result = runner.run().await;

        assert_eq!(result.status, WorkflowStatus::Completed);
        let workflow = harness.store.get_workflow("bd-1").unwrap();
        // The skipped step read as a success to its successor
        assert_eq!(workflow.variables["check"], "previous was true");
    }

    #[tokio::test]
    async fn test_loop_test_fix_cycle() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        // The script fails on iterations 1 and 2, passes on 3
        let grimoire = grimoire_from_yaml(
            r#"
name: test-fix
steps:
  - name: fix-loop
    type: loop
    max-iterations: 3
    on-max-iterations: block
    steps:
      - name: test
        type: script
        command: echo x >> tries.txt; test "$(wc -l < tries.txt)" -ge 3
        on-fail: continue
        on-success: exit_loop
      - name: fix
        type: agent
        content: fix it
        when: "{{.previous.failed}}"
"#,
        );

        let worktree = harness.worktree().await;
        let runner = WorkflowRunner::new(harness.config(grimoire, agent.clone()), &worktree, CancellationToken::new());
        let result = runner.run().await;

        assert_eq!(result.status, WorkflowStatus::Completed);
        // The fix agent ran on iterations 1 and 2 only
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn test_loop_max_iterations_block() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        let grimoire = grimoire_from_yaml(
            r#"
name: s
steps:
  - name: spin
    type: loop
    max-iterations: 2
    on-max-iterations: block
    steps:
      - name: fail
        type: script
        command: "false"
        on-fail: continue
"#,
        );

        let worktree = harness.worktree().await;
        let runner = WorkflowRunner::new(harness.config(grimoire, agent), &worktree, CancellationToken::new());
        let result = runner.run().await;

        assert_eq!(result.status, WorkflowStatus::Blocked);
        assert!(result.error.unwrap().contains("max iterations (2)"));
    }

    #[tokio::test]
    async fn test_loop_zero_iterations_continues() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        let grimoire = grimoire_from_yaml(
            r#"
name: s
steps:
  - name: empty
    type: loop
    max-iterations: 0
    on-max-iterations: block
    steps:
      - name: never
        type: script
        command: exit 1
"#,
        );

        let worktree = harness.worktree().await;
        let runner = WorkflowRunner::new(harness.config(grimoire, agent), &worktree, CancellationToken::new());
        let result = runner.run().await;
        assert_eq!(result.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_loop_iteration_counter_and_entry_restore() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        let grimoire = grimoire_from_yaml(
            r#"
name: s
steps:
  - name: loop
    type: loop
    max-iterations: 3
    steps:
      - name: record
        type: script
        command: echo iteration {{.loop.iteration}} leftover={{.scratch}} >> trace.txt
        output: scratch
"#,
        );

        let worktree = harness.worktree().await;
        let path = worktree.path.clone();
        let runner = WorkflowRunner::new(harness.config(grimoire, agent), &worktree, CancellationToken::new());
        runner.run().await;

        let trace = std::fs::read_to_string(path.join("trace.txt")).unwrap();
        // scratch from iteration N does not leak into iteration N+1
        assert_eq!(
            trace.lines().collect::<Vec<_>>(),
            vec!["iteration 1 leftover=", "iteration 2 leftover=", "iteration 3 leftover="]
        );
    }

    #[tokio::test]
    async fn test_script_failure_fails_workflow() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        let grimoire = grimoire_from_yaml(
            r#"
name: s
steps:
  - name: boom
    type: script
    command: exit 7
"#,
        );

        let worktree = harness.worktree().await;
        let runner = WorkflowRunner::new(harness.config(grimoire, agent), &worktree, CancellationToken::new());
        let result = runner.run().await;

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.error.unwrap().contains("code 7"));
        // Failed runs keep their persisted state for inspection
        let persisted = harness.persister.load("bd-1").unwrap().unwrap();
        assert_eq!(persisted.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_steps() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        let grimoire = grimoire_from_yaml(
            r#"
name: s
steps:
  - name: one
    type: script
    command: echo one >> log.txt
  - name: two
    type: script
    command: echo two >> log.txt
"#,
        );

        let worktree = harness.worktree().await;
        let mut state = WorkflowState::new("bd-1", "s", worktree.path.clone(), worktree.branch.clone());
        state.current_step = 1;

        let runner = WorkflowRunner::resume(harness.config(grimoire, agent), state, CancellationToken::new());
        let result = runner.run().await;

        assert_eq!(result.status, WorkflowStatus::Completed);
        let log = std::fs::read_to_string(worktree.path.join("log.txt")).unwrap();
        // Step one never re-executed
        assert_eq!(log, "two\n");
    }

    #[tokio::test]
    async fn test_cancellation_mid_step() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        let grimoire = grimoire_from_yaml(
            r#"
name: s
steps:
  - name: slow
    type: script
    command: sleep 30
"#,
        );

        let worktree = harness.worktree().await;
        let cancel = CancellationToken::new();
        let runner = WorkflowRunner::new(harness.config(grimoire, agent), &worktree, cancel.clone());

        let handle = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_review_merge_parks_then_approval_continues() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        let grimoire = grimoire_from_yaml(
            r#"
name: s
steps:
  - name: work
    type: script
    command: echo change > change.txt
  - name: merge
    type: merge
    require-review: true
  - name: after
    type: script
    command: "true"
"#,
        );

        let worktree = harness.worktree().await;
        let gates = harness.gates.clone();
        let persister = harness.persister.clone();
        let runner = WorkflowRunner::new(harness.config(grimoire, agent), &worktree, CancellationToken::new());

        let handle = tokio::spawn(runner.run());

        // Wait for the park
        for _ in 0..50 {
            if gates.is_parked("bd-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gates.is_parked("bd-1"));

        let persisted = persister.load("bd-1").unwrap().unwrap();
        assert_eq!(persisted.status, WorkflowStatus::PendingMerge);
        assert_eq!(persisted.current_step, 1);
        // The worktree survives while parked
        assert!(worktree.path.exists());

        gates.signal("bd-1", MergeDecision::Approved { feedback: None });
        let result = handle.await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_review_merge_rejection_blocks() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        let grimoire = grimoire_from_yaml(
            r#"
name: s
steps:
  - name: merge
    type: merge
    require-review: true
"#,
        );

        let worktree = harness.worktree().await;
        let gates = harness.gates.clone();
        let runner = WorkflowRunner::new(harness.config(grimoire, agent), &worktree, CancellationToken::new());

        let handle = tokio::spawn(runner.run());
        for _ in 0..50 {
            if gates.is_parked("bd-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        gates.signal(
            "bd-1",
            MergeDecision::Rejected {
                reason: "needs tests".to_string(),
            },
        );
        let result = handle.await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Blocked);
        assert_eq!(result.error.as_deref(), Some("needs tests"));
        // Rejection leaves the worktree for inspection
        assert!(worktree.path.exists());
    }

    #[tokio::test]
    async fn test_step_events_ordered() {
        let harness = Harness::new().await;
        let agent = ScriptedAgent::new(vec![]);
        let mut rx = harness.bus.subscribe();
        let grimoire = grimoire_from_yaml(
            r#"
name: s
steps:
  - name: only
    type: script
    command: echo hi
"#,
        );

        let worktree = harness.worktree().await;
        let runner = WorkflowRunner::new(harness.config(grimoire, agent), &worktree, CancellationToken::new());
        runner.run().await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.event_type().to_string());
        }
        let started = seen.iter().position(|e| e == "workflow.step.started").unwrap();
        let completed = seen.iter().position(|e| e == "workflow.step.completed").unwrap();
        let terminal = seen.iter().position(|e| e == "workflow.completed").unwrap();
        assert!(started < completed);
        assert!(completed < terminal);
    }

}
