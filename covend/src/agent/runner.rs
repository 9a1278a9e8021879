//! Agent subprocess adapter.
//!
//! Spawns the configured agent command in the worktree, feeds the rendered
//! spell on stdin, and streams stdout back line by line. Each line lands in
//! the bead's rolling output log and on the event bus; a line that parses as
//! `{"question": ..., "options": [...]}` registers a Question. Answers are
//! delivered back to the agent as JSON lines on its still-open stdin.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::Question;
use crate::events::{Event, EventBus};
use crate::state::StateStore;

/// One agent step invocation
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub task_id: String,
    pub prompt: String,
    pub worktree: PathBuf,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

/// What the subprocess produced
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub exit_code: i32,
    pub output: String,
    pub timed_out: bool,
}

/// Spawns an agent and reports its final output
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, invocation: AgentInvocation) -> Result<AgentRunResult>;
}

/// Routes question answers to the running agent that asked
#[derive(Clone, Default)]
pub struct AnswerRouter {
    inboxes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>,
}

impl AnswerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, task_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task_id.to_string(), tx);
        rx
    }

    fn unregister(&self, task_id: &str) {
        self.inboxes.lock().unwrap_or_else(|p| p.into_inner()).remove(task_id);
    }

    /// Deliver an answer line to the agent working `task_id`, if one is live
    pub fn deliver(&self, task_id: &str, question_id: &str, answer: &str) -> bool {
        let line = serde_json::json!({ "questionId": question_id, "answer": answer }).to_string();
        let inboxes = self.inboxes.lock().unwrap_or_else(|p| p.into_inner());
        match inboxes.get(task_id) {
            Some(tx) => tx.send(line).is_ok(),
            None => false,
        }
    }
}

/// A stdout line an agent uses to ask the user something
#[derive(Debug, Deserialize)]
struct QuestionLine {
    question: String,
    #[serde(default)]
    options: Option<Vec<String>>,
}

/// Production runner: spawns the configured command line
pub struct CommandAgentRunner {
    command: String,
    bus: Arc<EventBus>,
    store: Arc<StateStore>,
    router: AnswerRouter,
    output_dir: PathBuf,
}

impl CommandAgentRunner {
    pub fn new(command: String, bus: Arc<EventBus>, store: Arc<StateStore>, router: AnswerRouter, output_dir: PathBuf) -> Self {
        Self {
            command,
            bus,
            store,
            router,
            output_dir,
        }
    }

    fn build_command(&self, worktree: &PathBuf) -> Result<Command> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or_else(|| eyre!("agent command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .current_dir(worktree)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Inspect one stdout line for a question marker
    fn check_question(&self, task_id: &str, line: &str) {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return;
        }
        if let Ok(q) = serde_json::from_str::<QuestionLine>(trimmed) {
            info!(task_id, question = %q.question, "Agent asked a question");
            self.store.add_question(Question::new(task_id, q.question, q.options));
        }
    }
}

#[async_trait]
impl AgentRunner for CommandAgentRunner {
    async fn run(&self, invocation: AgentInvocation) -> Result<AgentRunResult> {
        let task_id = invocation.task_id.clone();
        debug!(%task_id, worktree = %invocation.worktree.display(), "Spawning agent");

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .context("Failed to create output directory")?;
        let log_path = self.output_dir.join(format!("{task_id}.log"));
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .context("Failed to open agent output log")?;

        let mut child = self
            .build_command(&invocation.worktree)?
            .spawn()
            .context("Failed to spawn agent process")?;

        let mut stdin = child.stdin.take().ok_or_else(|| eyre!("agent stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| eyre!("agent stdout unavailable"))?;
        let stderr = child.stderr.take().ok_or_else(|| eyre!("agent stderr unavailable"))?;

        stdin
            .write_all(invocation.prompt.as_bytes())
            .await
            .context("Failed to write prompt to agent stdin")?;
        stdin.write_all(b"\n").await.ok();
        stdin.flush().await.ok();

        // stdin stays open: answers to agent questions arrive through it
        let mut answers = self.router.register(&task_id);
        let answer_task = tokio::spawn(async move {
            while let Some(line) = answers.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = stdin.write_all(b"\n").await;
                let _ = stdin.flush().await;
            }
        });

        // Drain stderr into the log without parsing
        let mut stderr_lines = BufReader::new(stderr).lines();
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            while let Ok(Some(line)) = stderr_lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut output = String::new();
        let deadline = tokio::time::Instant::now() + invocation.timeout;
        let mut timed_out = false;
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            log.write_all(line.as_bytes()).await.ok();
                            log.write_all(b"\n").await.ok();
                            self.check_question(&task_id, &line);
                            self.bus.emit(Event::AgentOutput {
                                task_id: task_id.clone(),
                                line: line.clone(),
                            });
                            output.push_str(&line);
                            output.push('\n');
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%task_id, error = %e, "Agent stdout read failed");
                            break;
                        }
                    }
                }
                () = invocation.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                () = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out || cancelled {
            debug!(%task_id, timed_out, cancelled, "Killing agent process");
            let _ = child.kill().await;
        }

        let status = child.wait().await.context("Failed to wait for agent process")?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        if !stderr_text.is_empty() {
            log.write_all(stderr_text.as_bytes()).await.ok();
        }
        log.flush().await.ok();
        answer_task.abort();
        self.router.unregister(&task_id);

        if cancelled {
            return Err(eyre!("agent cancelled"));
        }

        let exit_code = if timed_out { -1 } else { status.code().unwrap_or(-1) };
        info!(%task_id, exit_code, timed_out, "Agent process finished");
        Ok(AgentRunResult {
            exit_code,
            output,
            timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner(temp: &TempDir, command: &str) -> (CommandAgentRunner, Arc<StateStore>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let store = Arc::new(StateStore::new(bus.clone()));
        let runner = CommandAgentRunner::new(
            command.to_string(),
            bus.clone(),
            store.clone(),
            AnswerRouter::new(),
            temp.path().join("output"),
        );
        (runner, store, bus)
    }

    fn invocation(temp: &TempDir, timeout: Duration) -> AgentInvocation {
        AgentInvocation {
            task_id: "bd-1".to_string(),
            prompt: "do the thing".to_string(),
            worktree: temp.path().to_path_buf(),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_cat_echoes_prompt() {
        let temp = TempDir::new().unwrap();
        // `head -n1` reads the prompt line from stdin and exits
        let (runner, _store, bus) = runner(&temp, "head -n1");
        let mut rx = bus.subscribe();

        let result = runner.run(invocation(&temp, Duration::from_secs(10))).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("do the thing"));
        assert!(!result.timed_out);

        // Output was streamed as events and logged to disk
        assert_eq!(rx.recv().await.unwrap().event_type(), "agent.output");
        let log = std::fs::read_to_string(temp.path().join("output/bd-1.log")).unwrap();
        assert!(log.contains("do the thing"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported() {
        let temp = TempDir::new().unwrap();
        let (runner, _store, _bus) = runner(&temp, "false");
        let result = runner.run(invocation(&temp, Duration::from_secs(10))).await.unwrap();
        assert_eq!(result.exit_code, 1);
    }

    #[tokio::test]
    async fn test_timeout_kills_agent() {
        let temp = TempDir::new().unwrap();
        let (runner, _store, _bus) = runner(&temp, "sleep 60");
        let result = runner.run(invocation(&temp, Duration::from_millis(200))).await.unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn test_cancel_kills_agent() {
        let temp = TempDir::new().unwrap();
        let (runner, _store, _bus) = runner(&temp, "sleep 60");
        let mut inv = invocation(&temp, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        inv.cancel = cancel.clone();

        let handle = tokio::spawn(async move { runner.run(inv).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_question_line_registers_question() {
        let temp = TempDir::new().unwrap();
        let script = temp.path().join("ask.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nhead -n1 > /dev/null\necho '{\"question\": \"Which db?\", \"options\": [\"sqlite\"]}'\n",
        )
        .unwrap();
        let (runner, store, _bus) = runner(&temp, &format!("sh {}", script.display()));

        runner.run(invocation(&temp, Duration::from_secs(10))).await.unwrap();

        let questions = store.get_questions();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].text, "Which db?");
        assert_eq!(questions[0].task_id, "bd-1");
    }
}
