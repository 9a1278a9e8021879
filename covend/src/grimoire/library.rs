//! Grimoire library - loads step programs from `.coven/grimoires/` and
//! resolves which one runs for a given bead.
//!
//! Resolution order: `grimoire:<name>` label, then the configured per-type
//! mapping, then the configured default. A missing default falls back to an
//! embedded `standard` grimoire so a fresh workspace can run unconfigured.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::GrimoireSection;
use crate::domain::Bead;

use super::step::Grimoire;

/// Errors from loading or resolving grimoires
#[derive(Debug, thiserror::Error)]
pub enum GrimoireError {
    #[error("grimoire not found: {0}")]
    NotFound(String),

    #[error("failed to parse grimoire {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to read grimoire directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Embedded fallback used when no `standard.yml` exists on disk
const EMBEDDED_STANDARD: &str = r#"
name: standard
description: Implement the bead with a single agent pass, then merge under review
steps:
  - name: implement
    type: agent
    spell: implement
    output: impl
  - name: merge
    type: merge
    require-review: true
"#;

/// In-memory set of parsed grimoires
pub struct Library {
    grimoires: HashMap<String, Grimoire>,
    routing: GrimoireSection,
}

impl Library {
    /// Load every `*.yml` / `*.yaml` under the grimoire directory
    pub fn load(dir: &Path, routing: GrimoireSection) -> Result<Self, GrimoireError> {
        let mut grimoires = HashMap::new();

        if dir.is_dir() {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                let is_yaml = path
                    .extension()
                    .is_some_and(|ext| ext == "yml" || ext == "yaml");
                if !is_yaml {
                    continue;
                }

                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let content = fs::read_to_string(&path)?;
                match serde_yaml::from_str::<Grimoire>(&content) {
                    Ok(grimoire) => {
                        debug!(name = %grimoire.name, path = %path.display(), "Loaded grimoire");
                        grimoires.insert(grimoire.name.clone(), grimoire);
                    }
                    Err(e) => {
                        // A broken file must not take the daemon down
                        warn!(name = %name, error = %e, "Skipping unparseable grimoire");
                    }
                }
            }
        }

        if !grimoires.contains_key("standard") {
            let standard: Grimoire =
                serde_yaml::from_str(EMBEDDED_STANDARD).map_err(|source| GrimoireError::Parse {
                    name: "standard".to_string(),
                    source,
                })?;
            grimoires.insert("standard".to_string(), standard);
        }

        info!(count = grimoires.len(), "Grimoire library loaded");
        Ok(Self { grimoires, routing })
    }

    /// Library with no on-disk grimoires (embedded standard only)
    pub fn embedded_only(routing: GrimoireSection) -> Self {
        // Embedded YAML is compile-time constant and known to parse
        Self::load(Path::new("/nonexistent"), routing).unwrap_or_else(|_| Self {
            grimoires: HashMap::new(),
            routing: GrimoireSection::default(),
        })
    }

    /// Look up a grimoire by name
    pub fn get(&self, name: &str) -> Option<&Grimoire> {
        self.grimoires.get(name)
    }

    /// Resolve the grimoire for a bead: label, type mapping, then default
    pub fn resolve(&self, bead: &Bead) -> Result<&Grimoire, GrimoireError> {
        let name = bead
            .grimoire_label()
            .map(str::to_string)
            .or_else(|| self.routing.by_type.get(&bead.bead_type).cloned())
            .unwrap_or_else(|| self.routing.default_grimoire.clone());

        self.grimoires
            .get(&name)
            .ok_or(GrimoireError::NotFound(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BeadStatus;
    use tempfile::TempDir;

    fn bead(bead_type: &str, labels: &[&str]) -> Bead {
        Bead {
            id: "bd-1".to_string(),
            title: "t".to_string(),
            body: String::new(),
            bead_type: bead_type.to_string(),
            priority: 1,
            labels: labels.iter().map(|s| s.to_string()).collect(),
            dependencies: vec![],
            status: BeadStatus::Open,
        }
    }

    #[test]
    fn test_embedded_standard_always_present() {
        let library = Library::embedded_only(GrimoireSection::default());
        let grimoire = library.get("standard").unwrap();
        assert_eq!(grimoire.steps.len(), 2);
    }

    #[test]
    fn test_load_from_dir() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("review.yml"),
            "name: review\nsteps:\n  - name: review\n    type: agent\n    spell: review\n",
        )
        .unwrap();
        fs::write(temp.path().join("notes.txt"), "not a grimoire").unwrap();

        let library = Library::load(temp.path(), GrimoireSection::default()).unwrap();
        assert!(library.get("review").is_some());
        assert!(library.get("notes").is_none());
    }

    #[test]
    fn test_broken_file_skipped() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("bad.yml"), "steps: [not, a, grimoire").unwrap();

        let library = Library::load(temp.path(), GrimoireSection::default()).unwrap();
        assert!(library.get("bad").is_none());
        assert!(library.get("standard").is_some());
    }

    #[test]
    fn test_resolve_label_beats_type_and_default() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("hotfix.yml"),
            "name: hotfix\nsteps:\n  - name: fix\n    type: agent\n    spell: fix\n",
        )
        .unwrap();
        fs::write(
            temp.path().join("bugs.yml"),
            "name: bugs\nsteps:\n  - name: fix\n    type: agent\n    spell: fix\n",
        )
        .unwrap();

        let mut routing = GrimoireSection::default();
        routing.by_type.insert("bug".to_string(), "bugs".to_string());
        let library = Library::load(temp.path(), routing).unwrap();

        assert_eq!(
            library.resolve(&bead("bug", &["grimoire:hotfix"])).unwrap().name,
            "hotfix"
        );
        assert_eq!(library.resolve(&bead("bug", &[])).unwrap().name, "bugs");
        assert_eq!(library.resolve(&bead("feature", &[])).unwrap().name, "standard");
    }

    #[test]
    fn test_resolve_unknown_label_errors() {
        let library = Library::embedded_only(GrimoireSection::default());
        let result = library.resolve(&bead("feature", &["grimoire:missing"]));
        assert!(matches!(result, Err(GrimoireError::NotFound(name)) if name == "missing"));
    }
}
