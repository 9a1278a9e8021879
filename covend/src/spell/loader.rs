//! Spell loader and renderer.
//!
//! Spells live as handlebars templates under `.coven/spells/<name>.md`.
//! Every file in the directory is also registered as a partial under its
//! stem, so spells can include shared fragments with `{{> fragment}}`.

use std::fs;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde_json::Value;
use tracing::debug;

/// Errors from loading or rendering spells
#[derive(Debug, thiserror::Error)]
pub enum SpellError {
    #[error("spell not found: {0}")]
    NotFound(String),

    #[error("failed to render spell: {0}")]
    Render(#[from] Box<handlebars::RenderError>),

    #[error("failed to read spell: {0}")]
    Io(#[from] std::io::Error),
}

/// Loads spell templates and renders them against a variable context
pub struct SpellLoader {
    hbs: Handlebars<'static>,
    spell_dir: Option<PathBuf>,
}

impl SpellLoader {
    /// Loader rooted at the workspace spell directory
    pub fn new(spell_dir: impl AsRef<Path>) -> Self {
        let spell_dir = spell_dir.as_ref().to_path_buf();
        let mut hbs = Handlebars::new();

        // Register every spell as a partial so templates can compose
        if let Ok(entries) = fs::read_dir(&spell_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                    continue;
                };
                if let Ok(content) = fs::read_to_string(&path) {
                    debug!(name = %stem, "Registered spell partial");
                    let _ = hbs.register_partial(&stem, content);
                }
            }
        }

        Self {
            hbs,
            spell_dir: spell_dir.exists().then_some(spell_dir),
        }
    }

    /// Loader with no spell directory (inline content only, for tests)
    pub fn inline_only() -> Self {
        Self {
            hbs: Handlebars::new(),
            spell_dir: None,
        }
    }

    /// Read a named spell's template source
    pub fn load(&self, name: &str) -> Result<String, SpellError> {
        let dir = self.spell_dir.as_ref().ok_or_else(|| SpellError::NotFound(name.to_string()))?;
        let path = dir.join(format!("{name}.md"));
        if !path.exists() {
            return Err(SpellError::NotFound(name.to_string()));
        }
        Ok(fs::read_to_string(path)?)
    }

    /// Render a spell template against the full context
    pub fn render(&self, template: &str, context: &Value) -> Result<String, SpellError> {
        self.hbs
            .render_template(template, context)
            .map_err(|e| SpellError::Render(Box::new(e)))
    }
}
