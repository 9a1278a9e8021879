//! Script step executor.
//!
//! Runs the rendered command through `sh -c` in the worktree. A non-zero
//! exit is a reportable failure, not an execution error; timeouts report
//! exit code -1. The declarative `on-fail` / `on-success` fields decide the
//! control-flow action.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::grimoire::{OnFail, OnSuccess};

use super::context::VariableContext;
use super::result::{StepAction, StepOutcome, StepResult};

/// Join trimmed stdout and stderr, collapsing empty sides
pub fn combine_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("{stdout}\n{stderr}"),
        (false, true) => stdout.to_string(),
        (true, _) => stderr.to_string(),
    }
}

/// Derive the action for a script result
fn derive_action(success: bool, on_fail: OnFail, on_success: Option<OnSuccess>) -> StepAction {
    if success {
        return match on_success {
            Some(OnSuccess::ExitLoop) => StepAction::ExitLoop,
            None => StepAction::Continue,
        };
    }
    match on_fail {
        OnFail::Continue => StepAction::Continue,
        OnFail::Block => StepAction::Block,
        OnFail::Fail => StepAction::Fail,
    }
}

/// Execute one script step
pub async fn run_script(
    command: &str,
    on_fail: OnFail,
    on_success: Option<OnSuccess>,
    ctx: &VariableContext,
    worktree: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> StepOutcome {
    let started = Instant::now();

    let rendered = match ctx.render_command(command) {
        Ok(rendered) => rendered,
        Err(e) => {
            return StepOutcome::Completed(StepResult::failure(
                String::new(),
                -1,
                started.elapsed(),
                e.to_string(),
                derive_action(false, on_fail, on_success),
            ));
        }
    };

    debug!(command = %rendered, worktree = %worktree.display(), "Running script step");

    let child = Command::new("sh")
        .arg("-c")
        .arg(&rendered)
        .current_dir(worktree)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return StepOutcome::Completed(StepResult::failure(
                String::new(),
                -1,
                started.elapsed(),
                format!("failed to spawn shell: {e}"),
                derive_action(false, on_fail, on_success),
            ));
        }
    };

    // Dropping the in-flight wait kills the child (kill_on_drop)
    let output = tokio::select! {
        output = child.wait_with_output() => output,
        () = cancel.cancelled() => return StepOutcome::Cancelled,
        () = tokio::time::sleep(timeout) => {
            return StepOutcome::Completed(StepResult::failure(
                String::new(),
                -1,
                started.elapsed(),
                format!("step timed out after {timeout:?}"),
                derive_action(false, on_fail, on_success),
            ));
        }
    };

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            return StepOutcome::Completed(StepResult::failure(
                String::new(),
                -1,
                started.elapsed(),
                format!("failed to wait for script: {e}"),
                derive_action(false, on_fail, on_success),
            ));
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let success = output.status.success();
    let combined = combine_output(
        &String::from_utf8_lossy(&output.stdout),
        &String::from_utf8_lossy(&output.stderr),
    );

    StepOutcome::Completed(StepResult {
        success,
        output: combined,
        exit_code,
        duration: started.elapsed(),
        error: (!success).then(|| format!("script exited with code {exit_code}")),
        action: derive_action(success, on_fail, on_success),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn run(command: &str, on_fail: OnFail, on_success: Option<OnSuccess>) -> StepResult {
        let temp = TempDir::new().unwrap();
        let ctx = VariableContext::new();
        match run_script(
            command,
            on_fail,
            on_success,
            &ctx,
            temp.path(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        {
            StepOutcome::Completed(result) => result,
            StepOutcome::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn test_success_continues() {
        let result = run("echo hi", OnFail::Fail, None).await;
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "hi");
        assert_eq!(result.action, StepAction::Continue);
    }

    #[tokio::test]
    async fn test_success_exit_loop() {
        let result = run("true", OnFail::Fail, Some(OnSuccess::ExitLoop)).await;
        assert!(result.success);
        assert_eq!(result.action, StepAction::ExitLoop);
    }

    #[tokio::test]
    async fn test_failure_actions() {
        let result = run("exit 3", OnFail::Fail, None).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.action, StepAction::Fail);

        let result = run("exit 3", OnFail::Continue, None).await;
        assert_eq!(result.action, StepAction::Continue);

        let result = run("exit 3", OnFail::Block, None).await;
        assert_eq!(result.action, StepAction::Block);
    }

    #[tokio::test]
    async fn test_combined_output() {
        let result = run("echo out; echo err >&2", OnFail::Fail, None).await;
        assert_eq!(result.output, "out\nerr");

        let result = run("echo err-only >&2", OnFail::Fail, None).await;
        assert_eq!(result.output, "err-only");
    }

    #[tokio::test]
    async fn test_timeout() {
        let temp = TempDir::new().unwrap();
        let ctx = VariableContext::new();
        let outcome = run_script(
            "sleep 30",
            OnFail::Fail,
            None,
            &ctx,
            temp.path(),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await;

        let StepOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.error.as_deref().unwrap().starts_with("step timed out after"));
        assert_eq!(result.action, StepAction::Fail);
    }

    #[tokio::test]
    async fn test_cancellation() {
        let temp = TempDir::new().unwrap();
        let ctx = VariableContext::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run_script(
            "sleep 30",
            OnFail::Fail,
            None,
            &ctx,
            temp.path(),
            Duration::from_secs(30),
            &cancel,
        )
        .await;
        assert!(matches!(outcome, StepOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_render_failure_fails_before_execution() {
        let result = run("echo {{.x", OnFail::Fail, None).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.error.as_deref().unwrap().contains("unclosed"));
    }

    #[tokio::test]
    async fn test_variables_shell_escaped() {
        let temp = TempDir::new().unwrap();
        let mut ctx = VariableContext::new();
        ctx.set("msg", serde_json::Value::String("two words; echo injected".to_string()));
        let outcome = run_script(
            "printf %s {{.msg}}",
            OnFail::Fail,
            None,
            &ctx,
            temp.path(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;
        let StepOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(result.output, "two words; echo injected");
    }
}
