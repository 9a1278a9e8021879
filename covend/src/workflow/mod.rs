//! Workflow engine - variable context, step executors, the runner, and
//! durable run state.

mod agent;
mod context;
mod output;
mod persist;
mod result;
mod runner;
mod script;

pub use agent::run_agent;
pub use context::{shell_escape, ContextSnapshot, RenderError, VariableContext};
pub use output::{parse_agent_output, AgentOutput};
pub use persist::{PersistError, WorkflowPersister, WorkflowState, WorkflowStatus};
pub use result::{StepAction, StepOutcome, StepResult};
pub use runner::{MergeDecision, MergeGates, WorkflowConfig, WorkflowResult, WorkflowRunner};
pub use script::run_script;
