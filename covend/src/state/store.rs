//! StateStore - mutex-guarded shared state with event publication.
//!
//! All mutations take the exclusive lock and publish their event *while
//! still holding it*: the lock is the only ordering authority, so a client
//! that snapshots and subscribes inside the shared lock can never observe
//! an event that precedes its snapshot.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::{AgentRecord, AgentStatus, Bead, BeadStatus, Question};
use crate::events::{Event, EventBus};
use crate::workflow::WorkflowState;

/// Full-state snapshot carried by `state.snapshot` events and `GET /state`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub tasks: Vec<Bead>,
    pub agents: Vec<AgentRecord>,
    pub questions: Vec<Question>,
    pub workflows: Vec<WorkflowState>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, Bead>,
    agents: HashMap<String, AgentRecord>,
    questions: HashMap<String, Question>,
    workflows: HashMap<String, WorkflowState>,
}

impl Inner {
    fn snapshot(&self) -> StateSnapshot {
        let mut tasks: Vec<_> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        let mut agents: Vec<_> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let mut questions: Vec<_> = self.questions.values().cloned().collect();
        questions.sort_by(|a, b| a.asked_at.cmp(&b.asked_at));
        let mut workflows: Vec<_> = self.workflows.values().cloned().collect();
        workflows.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        StateSnapshot {
            tasks,
            agents,
            questions,
            workflows,
            taken_at: Utc::now(),
        }
    }
}

/// Authoritative in-memory state, source of truth for the event fan-out
pub struct StateStore {
    inner: RwLock<Inner>,
    bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            bus,
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // === Tasks ===

    /// Refresh the bead cache from the external store; publishes
    /// `task.updated` for each new or changed bead
    pub fn sync_tasks(&self, beads: Vec<Bead>) {
        let mut inner = self.write();
        for bead in beads {
            let changed = inner.tasks.get(&bead.id) != Some(&bead);
            if changed {
                debug!(task_id = %bead.id, status = %bead.status, "StateStore: task updated");
                inner.tasks.insert(bead.id.clone(), bead.clone());
                self.bus.emit(Event::TaskUpdated { task: bead });
            }
        }
    }

    pub fn get_tasks(&self) -> Vec<Bead> {
        self.read().snapshot().tasks
    }

    pub fn get_task(&self, id: &str) -> Option<Bead> {
        self.read().tasks.get(id).cloned()
    }

    /// Set a bead's cached status; returns false for unknown beads
    pub fn update_task_status(&self, id: &str, status: BeadStatus) -> bool {
        let mut inner = self.write();
        let Some(bead) = inner.tasks.get_mut(id) else {
            return false;
        };
        bead.status = status;
        let bead = bead.clone();
        self.bus.emit(Event::TaskUpdated { task: bead });
        true
    }

    // === Agents ===

    /// Register a fresh agent record for a bead
    pub fn add_agent(&self, record: AgentRecord) {
        let mut inner = self.write();
        inner.agents.insert(record.task_id.clone(), record.clone());
        self.bus.emit(Event::AgentStarted { agent: record });
    }

    pub fn get_agent(&self, task_id: &str) -> Option<AgentRecord> {
        self.read().agents.get(task_id).cloned()
    }

    pub fn get_agents(&self) -> Vec<AgentRecord> {
        self.read().snapshot().agents
    }

    pub fn list_running_agents(&self) -> Vec<AgentRecord> {
        let inner = self.read();
        let mut running: Vec<_> = inner.agents.values().filter(|a| a.status.is_active()).cloned().collect();
        running.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        running
    }

    /// Transition an agent's status; the event matches the new status
    pub fn update_agent_status(&self, task_id: &str, status: AgentStatus) -> bool {
        let mut inner = self.write();
        let Some(agent) = inner.agents.get_mut(task_id) else {
            return false;
        };
        agent.status = status;
        let agent = agent.clone();
        let event = match status {
            AgentStatus::Starting | AgentStatus::Running => Event::AgentStarted { agent },
            AgentStatus::Completed => Event::AgentCompleted { agent },
            AgentStatus::Failed => Event::AgentFailed { agent },
            AgentStatus::Killed => Event::AgentKilled { agent },
        };
        self.bus.emit(event);
        true
    }

    pub fn set_agent_error(&self, task_id: &str, error: impl Into<String>) {
        let mut inner = self.write();
        if let Some(agent) = inner.agents.get_mut(task_id) {
            agent.error = Some(error.into());
        }
    }

    pub fn set_agent_exit_code(&self, task_id: &str, exit_code: i32) {
        let mut inner = self.write();
        if let Some(agent) = inner.agents.get_mut(task_id) {
            agent.exit_code = Some(exit_code);
        }
    }

    // === Questions ===

    pub fn add_question(&self, question: Question) {
        let mut inner = self.write();
        inner.questions.insert(question.id.clone(), question.clone());
        self.bus.emit(Event::AgentQuestion { question });
    }

    pub fn get_questions(&self) -> Vec<Question> {
        self.read().snapshot().questions
    }

    pub fn get_question(&self, id: &str) -> Option<Question> {
        self.read().questions.get(id).cloned()
    }

    /// Record an answer; returns the updated question, or None if unknown
    pub fn answer_question(&self, id: &str, answer: impl Into<String>) -> Option<Question> {
        let mut inner = self.write();
        let question = inner.questions.get_mut(id)?;
        question.answer = Some(answer.into());
        let question = question.clone();
        self.bus.emit(Event::QuestionAnswered {
            question: question.clone(),
        });
        Some(question)
    }

    // === Workflows ===

    /// Upsert the runtime view of a workflow run
    pub fn upsert_workflow(&self, state: WorkflowState) {
        let mut inner = self.write();
        inner.workflows.insert(state.task_id.clone(), state.clone());
        self.bus.emit(Event::WorkflowUpdated { workflow: state });
    }

    pub fn get_workflow(&self, task_id: &str) -> Option<WorkflowState> {
        self.read().workflows.get(task_id).cloned()
    }

    /// Resolve by task id first, then by workflow id
    pub fn find_workflow(&self, id: &str) -> Option<WorkflowState> {
        let inner = self.read();
        inner
            .workflows
            .get(id)
            .or_else(|| inner.workflows.values().find(|w| w.workflow_id == id))
            .cloned()
    }

    pub fn get_workflows(&self) -> Vec<WorkflowState> {
        self.read().snapshot().workflows
    }

    // === Snapshots ===

    pub fn snapshot(&self) -> StateSnapshot {
        self.read().snapshot()
    }

    /// Snapshot and subscribe atomically with respect to mutations, so the
    /// returned receiver never yields an event older than the snapshot
    pub fn snapshot_and_subscribe(&self) -> (StateSnapshot, broadcast::Receiver<Event>) {
        let inner = self.read();
        let rx = self.bus.subscribe();
        (inner.snapshot(), rx)
    }
}
