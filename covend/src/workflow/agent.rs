//! Agent step executor.
//!
//! Loads or inlines the spell, renders it against the context plus the
//! step's rendered inputs, invokes the agent runner in the worktree, and
//! parses the structured output. Agent failures always fail the workflow;
//! `on-fail` is a script-step concept.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::{AgentInvocation, AgentRunner};
use crate::spell::SpellLoader;

use super::context::VariableContext;
use super::output::{parse_agent_output, AgentOutput};
use super::result::{StepAction, StepOutcome, StepResult};

/// A step result plus the structured output the runner may bind
pub struct AgentStepOutcome {
    pub outcome: StepOutcome,
    pub parsed: Option<AgentOutput>,
    pub exit_code: Option<i32>,
}

impl AgentStepOutcome {
    fn completed(result: StepResult, parsed: Option<AgentOutput>, exit_code: Option<i32>) -> Self {
        Self {
            outcome: StepOutcome::Completed(result),
            parsed,
            exit_code,
        }
    }

    fn failed(error: String, started: Instant) -> Self {
        Self::completed(
            StepResult::failure(String::new(), -1, started.elapsed(), error, StepAction::Fail),
            None,
            None,
        )
    }
}

/// Execute one agent step
#[allow(clippy::too_many_arguments)]
pub async fn run_agent(
    task_id: &str,
    spell: Option<&str>,
    content: Option<&str>,
    input: &BTreeMap<String, String>,
    ctx: &VariableContext,
    spells: &SpellLoader,
    runner: &Arc<dyn AgentRunner>,
    worktree: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> AgentStepOutcome {
    let started = Instant::now();

    let template = match (spell, content) {
        (Some(name), _) => match spells.load(name) {
            Ok(template) => template,
            Err(e) => return AgentStepOutcome::failed(e.to_string(), started),
        },
        (None, Some(inline)) => inline.to_string(),
        (None, None) => return AgentStepOutcome::failed("agent step has neither spell nor content".to_string(), started),
    };

    // Step inputs may reference other variables; render them first, then
    // layer them over the context for the spell render
    let mut render_ctx = Value::Object(ctx.as_map().clone());
    for (key, template) in input {
        match ctx.render(template) {
            Ok(rendered) => {
                render_ctx[key.as_str()] = Value::String(rendered);
            }
            Err(e) => return AgentStepOutcome::failed(format!("failed to render input '{key}': {e}"), started),
        }
    }

    let prompt = match spells.render(&template, &render_ctx) {
        Ok(prompt) => prompt,
        Err(e) => return AgentStepOutcome::failed(e.to_string(), started),
    };

    debug!(%task_id, prompt_len = prompt.len(), "Invoking agent");

    let invocation = AgentInvocation {
        task_id: task_id.to_string(),
        prompt,
        worktree: worktree.to_path_buf(),
        timeout,
        cancel: cancel.clone(),
    };

    let run = match runner.run(invocation).await {
        Ok(run) => run,
        Err(e) => {
            if cancel.is_cancelled() {
                return AgentStepOutcome {
                    outcome: StepOutcome::Cancelled,
                    parsed: None,
                    exit_code: None,
                };
            }
            return AgentStepOutcome::failed(format!("agent runner failed: {e}"), started);
        }
    };

    if run.timed_out {
        let mut outcome = AgentStepOutcome::failed(format!("step timed out after {timeout:?}"), started);
        outcome.exit_code = Some(-1);
        return outcome;
    }

    let parsed = parse_agent_output(&run.output);
    let success = match &parsed {
        Some(output) => output.success,
        None => run.exit_code == 0,
    };
    let error = parsed
        .as_ref()
        .and_then(|o| o.error.clone())
        .or_else(|| (!success).then(|| format!("agent exited with code {}", run.exit_code)));

    let result = StepResult {
        success,
        output: run.output.trim().to_string(),
        exit_code: run.exit_code,
        duration: started.elapsed(),
        error: if success { None } else { error },
        action: if success { StepAction::Continue } else { StepAction::Fail },
    };

    AgentStepOutcome::completed(result, parsed, Some(run.exit_code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRunResult;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Agent fake returning canned responses, recording prompts
    struct ScriptedAgent {
        responses: Mutex<Vec<AgentRunResult>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedAgent {
        fn new(responses: Vec<AgentRunResult>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                prompts: Mutex::new(vec![]),
            })
        }

        fn reply(output: &str, exit_code: i32) -> AgentRunResult {
            AgentRunResult {
                exit_code,
                output: output.to_string(),
                timed_out: false,
            }
        }
    }

    #[async_trait]
    impl AgentRunner for ScriptedAgent {
        async fn run(&self, invocation: AgentInvocation) -> eyre::Result<AgentRunResult> {
            self.prompts.lock().unwrap().push(invocation.prompt);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(ScriptedAgent::reply("", 0));
            }
            Ok(responses.remove(0))
        }
    }

    async fn run_step(
        agent: &Arc<ScriptedAgent>,
        content: &str,
        input: BTreeMap<String, String>,
        ctx: &VariableContext,
    ) -> AgentStepOutcome {
        let temp = TempDir::new().unwrap();
        let runner: Arc<dyn AgentRunner> = agent.clone();
        run_agent(
            "bd-1",
            None,
            Some(content),
            &input,
            ctx,
            &SpellLoader::inline_only(),
            &runner,
            temp.path(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn test_structured_success() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::reply(
            "working...\n{\"success\":true,\"summary\":\"done\",\"outputs\":{\"files\":[\"a.txt\"]}}",
            0,
        )]);
        let ctx = VariableContext::new();
        let outcome = run_step(&agent, "implement it", BTreeMap::new(), &ctx).await;

        let StepOutcome::Completed(result) = outcome.outcome else {
            panic!("expected completion");
        };
        assert!(result.success);
        assert_eq!(result.action, StepAction::Continue);
        let parsed = outcome.parsed.unwrap();
        assert_eq!(parsed.summary, "done");
        assert_eq!(parsed.outputs.unwrap()["files"], serde_json::json!(["a.txt"]));
    }

    #[tokio::test]
    async fn test_inputs_rendered_into_prompt() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::reply("{\"success\":true,\"summary\":\"ok\"}", 0)]);
        let mut ctx = VariableContext::new();
        ctx.set("impl", serde_json::json!({"outputs": {"file": "src/auth.rs"}}));

        let mut input = BTreeMap::new();
        input.insert("target".to_string(), "{{.impl.outputs.file}}".to_string());
        run_step(&agent, "Review {{target}} carefully", input, &ctx).await;

        let prompts = agent.prompts.lock().unwrap();
        assert_eq!(prompts[0], "Review src/auth.rs carefully");
    }

    #[tokio::test]
    async fn test_no_structured_output_uses_exit_code() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::reply("prose only", 0)]);
        let ctx = VariableContext::new();
        let outcome = run_step(&agent, "go", BTreeMap::new(), &ctx).await;
        let StepOutcome::Completed(result) = outcome.outcome else {
            panic!("expected completion");
        };
        assert!(result.success);
        assert!(outcome.parsed.is_none());

        let agent = ScriptedAgent::new(vec![ScriptedAgent::reply("prose only", 2)]);
        let outcome = run_step(&agent, "go", BTreeMap::new(), &ctx).await;
        let StepOutcome::Completed(result) = outcome.outcome else {
            panic!("expected completion");
        };
        assert!(!result.success);
        // Agent failures never consult on-fail
        assert_eq!(result.action, StepAction::Fail);
    }

    #[tokio::test]
    async fn test_structured_failure_carries_error() {
        let agent = ScriptedAgent::new(vec![ScriptedAgent::reply(
            "{\"success\":false,\"summary\":\"could not build\",\"error\":\"missing dep\"}",
            0,
        )]);
        let ctx = VariableContext::new();
        let outcome = run_step(&agent, "go", BTreeMap::new(), &ctx).await;
        let StepOutcome::Completed(result) = outcome.outcome else {
            panic!("expected completion");
        };
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("missing dep"));
        assert_eq!(result.action, StepAction::Fail);
    }

    #[tokio::test]
    async fn test_missing_spell_fails() {
        let agent = ScriptedAgent::new(vec![]);
        let temp = TempDir::new().unwrap();
        let runner: Arc<dyn AgentRunner> = agent.clone();
        let outcome = run_agent(
            "bd-1",
            Some("ghost"),
            None,
            &BTreeMap::new(),
            &VariableContext::new(),
            &SpellLoader::inline_only(),
            &runner,
            temp.path(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;
        let StepOutcome::Completed(result) = outcome.outcome else {
            panic!("expected completion");
        };
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("ghost"));
    }
}
