//! Variable context - scoped, dotted-path variable resolution and the
//! `{{.path}}` rendering used by script commands and `when` guards.
//!
//! A missing path always resolves to the empty string so templates over
//! optional fields degrade gracefully.

use serde_json::{Map, Value};

use crate::domain::Bead;

/// Rendering failures detected before a step executes
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unclosed '{{{{' at byte {0} in template")]
    Unclosed(usize),
}

/// Snapshot of the context taken at loop entry
#[derive(Debug, Clone)]
pub struct ContextSnapshot(Map<String, Value>);

/// Workflow-scoped variable context
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    root: Map<String, Value>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context rehydrated from persisted variables
    pub fn from_map(root: Map<String, Value>) -> Self {
        Self { root }
    }

    /// The underlying map, for persistence
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.root
    }

    /// Bind a top-level variable
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.root.insert(name.into(), value);
    }

    /// Bind the `bead.*` fields from the current task
    pub fn bind_bead(&mut self, bead: &Bead) {
        self.set(
            "bead",
            serde_json::json!({
                "id": bead.id,
                "title": bead.title,
                "body": bead.body,
                "type": bead.bead_type,
                "priority": bead.priority,
                "labels": bead.labels,
            }),
        );
    }

    /// Bind `previous.*` from the last step in the current sibling sequence
    pub fn bind_previous(&mut self, success: bool, output: &str) {
        self.set(
            "previous",
            serde_json::json!({
                "success": success,
                "failed": !success,
                "output": output,
            }),
        );
    }

    /// Snapshot for `loop_entry` restoration
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot(self.root.clone())
    }

    /// Restore a snapshot, discarding everything bound since it was taken
    pub fn restore(&mut self, snapshot: &ContextSnapshot) {
        self.root = snapshot.0.clone();
    }

    /// Bind the loop sentinels for one iteration: the `loop_entry` view and
    /// the 1-based `loop.iteration` counter
    pub fn bind_loop_iteration(&mut self, snapshot: &ContextSnapshot, iteration: u32) {
        self.set("loop_entry", Value::Object(snapshot.0.clone()));
        self.set("loop", serde_json::json!({ "iteration": iteration }));
    }

    /// Resolve a dotted path to its value, walking maps and lists.
    /// Any missing segment yields `None`.
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.root.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Resolve a dotted path to a display string; missing resolves to ""
    pub fn resolve_string(&self, path: &str) -> String {
        self.resolve(path).map(stringify).unwrap_or_default()
    }

    /// Render `{{.path}}` placeholders without escaping (for `when` guards
    /// and step inputs)
    pub fn render(&self, template: &str) -> Result<String, RenderError> {
        self.render_with(template, |s| s)
    }

    /// Render `{{.path}}` placeholders with shell escaping (for script
    /// commands)
    pub fn render_command(&self, template: &str) -> Result<String, RenderError> {
        self.render_with(template, |s| shell_escape(&s))
    }

    fn render_with(&self, template: &str, transform: impl Fn(String) -> String) -> Result<String, RenderError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find("}}") else {
                return Err(RenderError::Unclosed(offset + open));
            };

            let path = after_open[..close].trim().trim_start_matches('.');
            out.push_str(&transform(self.resolve_string(path)));

            offset += open + 2 + close + 2;
            rest = &after_open[close + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Evaluate a `when` guard: the trimmed rendered text is falsy iff
    /// empty, "false", or "0"
    pub fn evaluate_when(&self, expr: &str) -> Result<bool, RenderError> {
        let rendered = self.render(expr)?;
        let trimmed = rendered.trim();
        Ok(!(trimmed.is_empty() || trimmed == "false" || trimmed == "0"))
    }
}

/// Stringify a value for substitution: strings verbatim, scalars via
/// display, null empty, containers as compact JSON
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Quote a string for POSIX sh. Strings of `[A-Za-z0-9_.-/]` pass through
/// unquoted; everything else is single-quoted with `'` rewritten to `'\''`.
pub fn shell_escape(s: &str) -> String {
    let safe = !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b'/'));
    if safe {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn context() -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.set(
            "impl",
            serde_json::json!({
                "success": true,
                "summary": "done",
                "outputs": { "files": ["a.txt", "b.txt"], "count": 2 },
            }),
        );
        ctx.set("branch", Value::String("coven/bd-1".to_string()));
        ctx
    }

    #[test]
    fn test_resolve_nested() {
        let ctx = context();
        assert_eq!(ctx.resolve_string("impl.summary"), "done");
        assert_eq!(ctx.resolve_string("impl.outputs.count"), "2");
        assert_eq!(ctx.resolve_string("impl.outputs.files.1"), "b.txt");
        assert_eq!(ctx.resolve_string("impl.outputs.files"), r#"["a.txt","b.txt"]"#);
    }

    #[test]
    fn test_resolve_missing_is_empty() {
        let ctx = context();
        assert_eq!(ctx.resolve_string("nope"), "");
        assert_eq!(ctx.resolve_string("impl.outputs.missing"), "");
        assert_eq!(ctx.resolve_string("impl.summary.deeper"), "");
    }

    #[test]
    fn test_render_command_escapes() {
        let mut ctx = context();
        ctx.set("msg", Value::String("it's done; rm -rf /".to_string()));
        let rendered = ctx.render_command("git commit -m {{.msg}}").unwrap();
        assert_eq!(rendered, r#"git commit -m 'it'\''s done; rm -rf /'"#);
    }

    #[test]
    fn test_render_command_safe_passthrough() {
        let ctx = context();
        let rendered = ctx.render_command("git checkout {{.branch}}").unwrap();
        assert_eq!(rendered, "git checkout coven/bd-1");
    }

    #[test]
    fn test_render_missing_is_quoted_empty() {
        let ctx = context();
        let rendered = ctx.render_command("echo {{.x}}").unwrap();
        assert_eq!(rendered, "echo ''");
    }

    #[test]
    fn test_render_unclosed_fails() {
        let ctx = context();
        assert!(matches!(ctx.render_command("echo {{.x"), Err(RenderError::Unclosed(5))));
    }

    #[test]
    fn test_evaluate_when() {
        let mut ctx = VariableContext::new();
        ctx.bind_previous(false, "boom");
        assert!(ctx.evaluate_when("{{.previous.failed}}").unwrap());
        assert!(!ctx.evaluate_when("{{.previous.success}}").unwrap());
        assert!(!ctx.evaluate_when("{{.missing}}").unwrap());
        assert!(ctx.evaluate_when("always").unwrap());
    }

    #[test]
    fn test_loop_entry_restore() {
        let mut ctx = context();
        let snapshot = ctx.snapshot();

        ctx.bind_loop_iteration(&snapshot, 1);
        ctx.set("scratch", Value::String("iteration 1 leftovers".to_string()));
        assert_eq!(ctx.resolve_string("loop.iteration"), "1");

        ctx.restore(&snapshot);
        ctx.bind_loop_iteration(&snapshot, 2);
        assert_eq!(ctx.resolve_string("scratch"), "");
        assert_eq!(ctx.resolve_string("loop.iteration"), "2");
        // loop_entry still sees pre-loop bindings
        assert_eq!(ctx.resolve_string("loop_entry.branch"), "coven/bd-1");
    }

    #[test]
    fn test_bind_bead() {
        use crate::domain::BeadStatus;
        let mut ctx = VariableContext::new();
        ctx.bind_bead(&Bead {
            id: "bd-7".to_string(),
            title: "Add auth".to_string(),
            body: "details".to_string(),
            bead_type: "feature".to_string(),
            priority: 2,
            labels: vec!["backend".to_string()],
            dependencies: vec![],
            status: BeadStatus::Open,
        });
        assert_eq!(ctx.resolve_string("bead.id"), "bd-7");
        assert_eq!(ctx.resolve_string("bead.title"), "Add auth");
        assert_eq!(ctx.resolve_string("bead.priority"), "2");
        assert_eq!(ctx.resolve_string("bead.labels.0"), "backend");
    }

    /// Invert shell single-quoting the way sh does: concatenation of quoted
    /// runs and `\'` escapes outside quotes.
    fn shell_unquote(s: &str) -> String {
        let mut out = String::new();
        let mut chars = s.chars().peekable();
        let mut in_quotes = false;
        while let Some(ch) = chars.next() {
            match ch {
                '\'' => in_quotes = !in_quotes,
                '\\' if !in_quotes => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                other => out.push(other),
            }
        }
        out
    }

    #[test]
    fn test_shell_escape_hostile_strings() {
        for original in ["it's", "a b", "$HOME", "`id`", "line\nbreak", "'", "''", ""] {
            assert_eq!(shell_unquote(&shell_escape(original)), original, "roundtrip of {original:?}");
        }
    }

    proptest! {
        #[test]
        fn prop_shell_escape_round_trips(original in ".*") {
            prop_assert_eq!(shell_unquote(&shell_escape(&original)), original);
        }
    }
}
