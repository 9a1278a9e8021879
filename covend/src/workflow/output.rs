//! Structured agent output parsing.
//!
//! An agent signals its result by printing a JSON object, usually inside a
//! fenced code block, somewhere in its final output. Fenced candidates are
//! preferred; bare top-level objects are the fallback. The last candidate
//! whose shape matches wins, so agents can think out loud in JSON without
//! confusing the parser.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The structured result an agent step reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    #[serde(default)]
    pub success: bool,

    #[serde(default)]
    pub summary: String,

    #[serde(default)]
    pub outputs: Option<Map<String, Value>>,

    #[serde(default)]
    pub error: Option<String>,
}

impl AgentOutput {
    /// A candidate only counts when it carries a summary or claims success
    fn shape_matches(&self) -> bool {
        self.success || !self.summary.is_empty()
    }

    /// Bindable context value: the object itself, with `outputs` reachable
    /// as `<name>.outputs.<key>`
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Extract the structured result from raw agent output, if any
pub fn parse_agent_output(text: &str) -> Option<AgentOutput> {
    if let Some(output) = last_match(fenced_candidates(text)) {
        return Some(output);
    }
    last_match(brace_candidates(text))
}

fn last_match(candidates: Vec<String>) -> Option<AgentOutput> {
    candidates
        .into_iter()
        .filter_map(|c| serde_json::from_str::<AgentOutput>(&c).ok())
        .filter(AgentOutput::shape_matches)
        .next_back()
}

/// Contents of ``` fences labelled `json` or unlabelled
fn fenced_candidates(text: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut block: Option<String> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        match &mut block {
            None => {
                if let Some(label) = trimmed.strip_prefix("```") {
                    let label = label.trim();
                    if label.is_empty() || label.eq_ignore_ascii_case("json") {
                        block = Some(String::new());
                    }
                }
            }
            Some(content) => {
                if trimmed.starts_with("```") {
                    candidates.push(std::mem::take(content));
                    block = None;
                } else {
                    content.push_str(line);
                    content.push('\n');
                }
            }
        }
    }
    candidates
}

/// Top-level brace-balanced `{...}` spans, string-aware
fn brace_candidates(text: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        candidates.push(text[start..=i].to_string());
                    }
                }
            }
            _ => {}
        }
    }
    candidates
}
