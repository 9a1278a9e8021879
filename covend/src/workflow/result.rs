//! StepResult - the in-memory outcome of a single step execution.

use std::time::Duration;

/// Control-flow action the runner takes after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Proceed to the next step
    Continue,
    /// Terminate the workflow as failed
    Fail,
    /// Park the workflow for human attention
    Block,
    /// Break out of the enclosing loop
    ExitLoop,
}

/// What an executor handed back: a result, or cancellation observed
/// mid-step
#[derive(Debug)]
pub enum StepOutcome {
    Completed(StepResult),
    Cancelled,
}

/// Outcome of one step execution
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Did the step succeed
    pub success: bool,

    /// Combined output (trimmed stdout + stderr for scripts, the final
    /// buffer for agents)
    pub output: String,

    /// Exit code of the underlying process; -1 for timeouts
    pub exit_code: i32,

    /// Wall-clock duration
    pub duration: Duration,

    /// Error description, when failed
    pub error: Option<String>,

    /// What the runner should do next
    pub action: StepAction,
}

impl StepResult {
    /// Successful result that continues the workflow
    pub fn success(output: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            output: output.into(),
            exit_code: 0,
            duration,
            error: None,
            action: StepAction::Continue,
        }
    }

    /// Failed result with the given action
    pub fn failure(output: impl Into<String>, exit_code: i32, duration: Duration, error: impl Into<String>, action: StepAction) -> Self {
        Self {
            success: false,
            output: output.into(),
            exit_code,
            duration,
            error: Some(error.into()),
            action,
        }
    }
}
