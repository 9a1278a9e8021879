//! Event types for the daemon's activity stream.
//!
//! Wire names are dotted (`task.updated`, `workflow.step.completed`, ...) so
//! clients can subscribe to families by prefix. Every event that belongs to
//! a bead carries its `taskId`.

use serde::{Deserialize, Serialize};

use crate::domain::{AgentRecord, Bead, Question};
use crate::state::StateSnapshot;
use crate::workflow::WorkflowState;

/// Per-event cap on embedded command output
pub const MAX_EVENT_OUTPUT: usize = 4096;

/// Truncate step/agent output for embedding in an event
pub fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_EVENT_OUTPUT {
        return output.to_string();
    }
    let mut end = MAX_EVENT_OUTPUT;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &output[..end])
}

/// Everything observable on the event stream
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Event {
    // === Tasks ===
    /// A bead changed in the local cache
    #[serde(rename = "task.updated")]
    TaskUpdated { task: Bead },

    // === Agents ===
    /// An agent record was created or moved to running
    #[serde(rename = "agent.started")]
    AgentStarted { agent: AgentRecord },

    /// One line of agent stdout
    #[serde(rename = "agent.output")]
    AgentOutput { task_id: String, line: String },

    #[serde(rename = "agent.completed")]
    AgentCompleted { agent: AgentRecord },

    #[serde(rename = "agent.failed")]
    AgentFailed { agent: AgentRecord },

    #[serde(rename = "agent.killed")]
    AgentKilled { agent: AgentRecord },

    /// An agent asked a question mid-run
    #[serde(rename = "agent.question")]
    AgentQuestion { question: Question },

    /// A question received its answer
    #[serde(rename = "question.answered")]
    QuestionAnswered { question: Question },

    // === Workflows ===
    #[serde(rename = "workflow.started")]
    WorkflowStarted {
        workflow_id: String,
        task_id: String,
        grimoire: String,
    },

    #[serde(rename = "workflow.step.started")]
    StepStarted {
        workflow_id: String,
        task_id: String,
        step: String,
        kind: String,
        index: usize,
    },

    #[serde(rename = "workflow.step.completed")]
    StepCompleted {
        workflow_id: String,
        task_id: String,
        step: String,
        index: usize,
        duration_ms: u64,
        exit_code: i32,
        output: String,
    },

    #[serde(rename = "workflow.step.failed")]
    StepFailed {
        workflow_id: String,
        task_id: String,
        step: String,
        index: usize,
        duration_ms: u64,
        exit_code: i32,
        error: String,
    },

    #[serde(rename = "workflow.step.blocked")]
    StepBlocked {
        workflow_id: String,
        task_id: String,
        step: String,
        index: usize,
        error: String,
    },

    #[serde(rename = "workflow.step.skipped")]
    StepSkipped {
        workflow_id: String,
        task_id: String,
        step: String,
        index: usize,
    },

    #[serde(rename = "workflow.completed")]
    WorkflowCompleted { workflow_id: String, task_id: String },

    #[serde(rename = "workflow.pending_merge")]
    WorkflowPendingMerge { workflow_id: String, task_id: String },

    #[serde(rename = "workflow.blocked")]
    WorkflowBlocked {
        workflow_id: String,
        task_id: String,
        error: String,
    },

    #[serde(rename = "workflow.failed")]
    WorkflowFailed {
        workflow_id: String,
        task_id: String,
        error: String,
    },

    #[serde(rename = "workflow.cancelled")]
    WorkflowCancelled { workflow_id: String, task_id: String },

    /// A workflow run record changed (used for non-terminal transitions)
    #[serde(rename = "workflow.updated")]
    WorkflowUpdated { workflow: WorkflowState },

    // === Snapshots ===
    /// Authoritative full-state snapshot; clients replace their cache
    #[serde(rename = "state.snapshot")]
    StateSnapshot { snapshot: StateSnapshot },
}

impl Event {
    /// Wire name of this event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskUpdated { .. } => "task.updated",
            Self::AgentStarted { .. } => "agent.started",
            Self::AgentOutput { .. } => "agent.output",
            Self::AgentCompleted { .. } => "agent.completed",
            Self::AgentFailed { .. } => "agent.failed",
            Self::AgentKilled { .. } => "agent.killed",
            Self::AgentQuestion { .. } => "agent.question",
            Self::QuestionAnswered { .. } => "question.answered",
            Self::WorkflowStarted { .. } => "workflow.started",
            Self::StepStarted { .. } => "workflow.step.started",
            Self::StepCompleted { .. } => "workflow.step.completed",
            Self::StepFailed { .. } => "workflow.step.failed",
            Self::StepBlocked { .. } => "workflow.step.blocked",
            Self::StepSkipped { .. } => "workflow.step.skipped",
            Self::WorkflowCompleted { .. } => "workflow.completed",
            Self::WorkflowPendingMerge { .. } => "workflow.pending_merge",
            Self::WorkflowBlocked { .. } => "workflow.blocked",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::WorkflowCancelled { .. } => "workflow.cancelled",
            Self::WorkflowUpdated { .. } => "workflow.updated",
            Self::StateSnapshot { .. } => "state.snapshot",
        }
    }

    /// The bead this event belongs to, when it belongs to one
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskUpdated { task } => Some(&task.id),
            Self::AgentStarted { agent }
            | Self::AgentCompleted { agent }
            | Self::AgentFailed { agent }
            | Self::AgentKilled { agent } => Some(&agent.task_id),
            Self::AgentOutput { task_id, .. } => Some(task_id),
            Self::AgentQuestion { question } | Self::QuestionAnswered { question } => Some(&question.task_id),
            Self::WorkflowStarted { task_id, .. }
            | Self::StepStarted { task_id, .. }
            | Self::StepCompleted { task_id, .. }
            | Self::StepFailed { task_id, .. }
            | Self::StepBlocked { task_id, .. }
            | Self::StepSkipped { task_id, .. }
            | Self::WorkflowCompleted { task_id, .. }
            | Self::WorkflowPendingMerge { task_id, .. }
            | Self::WorkflowBlocked { task_id, .. }
            | Self::WorkflowFailed { task_id, .. }
            | Self::WorkflowCancelled { task_id, .. } => Some(task_id),
            Self::WorkflowUpdated { workflow } => Some(&workflow.task_id),
            Self::StateSnapshot { .. } => None,
        }
    }
}
