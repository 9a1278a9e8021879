//! Step and grimoire definitions, parsed from YAML.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What to do when a script step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFail {
    /// Record the failure in `previous.failed` and move on
    Continue,
    /// Park the workflow for human attention
    Block,
    /// Terminate the workflow
    #[default]
    Fail,
}

/// What to do when a script step succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSuccess {
    /// Break out of the enclosing loop
    ExitLoop,
}

/// What to do when a loop hits its iteration cap without an exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMaxIterations {
    Block,
    Exit,
    #[default]
    Continue,
}

/// Kind-specific step fields, tagged by `type` in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Run an AI agent with a rendered spell
    Agent {
        /// Named spell under `.coven/spells/`
        #[serde(default)]
        spell: Option<String>,

        /// Inline spell content (used when `spell` is absent)
        #[serde(default)]
        content: Option<String>,

        /// Per-invocation variables, rendered against the context
        #[serde(default)]
        input: BTreeMap<String, String>,
    },

    /// Run a shell command in the worktree
    Script {
        /// Command template; `{{.path}}` references are shell-escaped
        command: String,

        #[serde(default, rename = "on-fail")]
        on_fail: OnFail,

        #[serde(default, rename = "on-success")]
        on_success: Option<OnSuccess>,
    },

    /// Repeat a nested step list until a child exits the loop
    Loop {
        steps: Vec<StepDef>,

        #[serde(default = "default_max_iterations", rename = "max-iterations")]
        max_iterations: u32,

        #[serde(default, rename = "on-max-iterations")]
        on_max_iterations: OnMaxIterations,
    },

    /// Integrate the worktree back into the base branch
    Merge {
        #[serde(default, rename = "require-review")]
        require_review: bool,
    },
}

fn default_max_iterations() -> u32 {
    10
}

/// One step of a grimoire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    /// Step name, used in events and logs
    pub name: String,

    #[serde(flatten)]
    pub kind: StepKind,

    /// Conditional guard rendered against the context; falsy skips the step
    #[serde(default)]
    pub when: Option<String>,

    /// Variable name the step's result binds under
    #[serde(default)]
    pub output: Option<String>,

    /// Per-step timeout override in milliseconds
    #[serde(default, rename = "timeout-ms")]
    pub timeout_ms: Option<u64>,
}

impl StepDef {
    /// Effective timeout given the configured defaults
    pub fn timeout(&self, agent_default_ms: u64, script_default_ms: u64) -> Duration {
        let default_ms = match self.kind {
            StepKind::Agent { .. } => agent_default_ms,
            _ => script_default_ms,
        };
        Duration::from_millis(self.timeout_ms.unwrap_or(default_ms))
    }

    /// Short kind tag for events
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            StepKind::Agent { .. } => "agent",
            StepKind::Script { .. } => "script",
            StepKind::Loop { .. } => "loop",
            StepKind::Merge { .. } => "merge",
        }
    }
}

/// A named, ordered step program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grimoire {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub steps: Vec<StepDef>,

    /// Default timeout for steps without their own, in milliseconds
    #[serde(default, rename = "timeout-ms")]
    pub timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: test-fix
description: Run tests, fix until green, merge
steps:
  - name: test-loop
    type: loop
    max-iterations: 3
    on-max-iterations: block
    steps:
      - name: test
        type: script
        command: npm test
        on-fail: continue
        on-success: exit_loop
      - name: fix
        type: agent
        spell: fix
        when: "{{.previous.failed}}"
  - name: merge
    type: merge
    require-review: true
"#;

    #[test]
    fn test_parse_grimoire_yaml() {
        let grimoire: Grimoire = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(grimoire.name, "test-fix");
        assert_eq!(grimoire.steps.len(), 2);

        let StepKind::Loop {
            steps,
            max_iterations,
            on_max_iterations,
        } = &grimoire.steps[0].kind
        else {
            panic!("expected loop step");
        };
        assert_eq!(*max_iterations, 3);
        assert_eq!(*on_max_iterations, OnMaxIterations::Block);
        assert_eq!(steps.len(), 2);

        let StepKind::Script { on_fail, on_success, .. } = &steps[0].kind else {
            panic!("expected script step");
        };
        assert_eq!(*on_fail, OnFail::Continue);
        assert_eq!(*on_success, Some(OnSuccess::ExitLoop));

        assert_eq!(steps[1].when.as_deref(), Some("{{.previous.failed}}"));

        let StepKind::Merge { require_review } = &grimoire.steps[1].kind else {
            panic!("expected merge step");
        };
        assert!(*require_review);
    }

    #[test]
    fn test_defaults() {
        let yaml = "name: s\nsteps:\n  - name: run\n    type: script\n    command: ls\n";
        let grimoire: Grimoire = serde_yaml::from_str(yaml).unwrap();
        let StepKind::Script { on_fail, on_success, .. } = &grimoire.steps[0].kind else {
            panic!("expected script step");
        };
        assert_eq!(*on_fail, OnFail::Fail);
        assert!(on_success.is_none());
    }

    #[test]
    fn test_timeout_defaults_by_kind() {
        let yaml = r#"
name: s
steps:
  - name: build
    type: script
    command: make
  - name: implement
    type: agent
    spell: implement
  - name: slow
    type: script
    command: make release
    timeout-ms: 60000
"#;
        let grimoire: Grimoire = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(grimoire.steps[0].timeout(900_000, 300_000), Duration::from_secs(300));
        assert_eq!(grimoire.steps[1].timeout(900_000, 300_000), Duration::from_secs(900));
        assert_eq!(grimoire.steps[2].timeout(900_000, 300_000), Duration::from_secs(60));
    }
}
