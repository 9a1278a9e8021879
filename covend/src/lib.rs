//! covend - per-workspace orchestration daemon for AI coding agents.
//!
//! The daemon polls an external task store ("beads"), creates an isolated
//! git worktree per ready bead, and drives a declarative step program (a
//! "grimoire") against it: agent steps render spells and run the coding
//! agent, script steps run shell commands, loops iterate until a step exits
//! them, and merge steps integrate the worktree back into the base branch,
//! optionally gated on human review. All state is observable over a unix
//! socket API with a snapshot-first SSE stream.
//!
//! # Modules
//!
//! - [`grimoire`] - step program definitions and resolution
//! - [`workflow`] - variable context, step executors, runner, persistence
//! - [`scheduler`] - the reconcile loop and merge-review transitions
//! - [`state`] / [`events`] - authoritative state and its event fan-out
//! - [`worktree`] / [`beads`] / [`agent`] / [`spell`] - external drivers
//! - [`api`] - the unix-socket HTTP/SSE surface

pub mod agent;
pub mod api;
pub mod beads;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod domain;
pub mod events;
pub mod grimoire;
pub mod scheduler;
pub mod spell;
pub mod state;
pub mod workflow;
pub mod worktree;

// Re-export commonly used types
pub use agent::{AgentInvocation, AgentRunResult, AgentRunner, AnswerRouter, CommandAgentRunner};
pub use beads::{BeadsCli, MemoryTaskStore, TaskStore, TaskStoreError};
pub use config::{Config, CovenPaths};
pub use domain::{AgentRecord, AgentStatus, Bead, BeadStatus, Question};
pub use events::{Event, EventBus};
pub use grimoire::{Grimoire, Library, StepDef, StepKind};
pub use scheduler::{ApproveError, ApproveOutcome, Scheduler, SchedulerDeps};
pub use spell::SpellLoader;
pub use state::{StateSnapshot, StateStore};
pub use workflow::{
    AgentOutput, MergeDecision, MergeGates, StepAction, StepResult, VariableContext, WorkflowConfig,
    WorkflowPersister, WorkflowResult, WorkflowRunner, WorkflowState, WorkflowStatus,
};
pub use worktree::{MergeOutcome, WorktreeInfo, WorktreeManager};
