//! Bead - a unit of work owned by the external task store.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a bead in the task store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl BeadStatus {
    /// Status string as the external store's CLI expects it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown bead status: {other}")),
        }
    }
}

/// A task cached from the external store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bead {
    /// Task identity in the external store
    pub id: String,

    /// One-line title
    pub title: String,

    /// Full description body
    #[serde(default)]
    pub body: String,

    /// Task type (feature, bug, chore, ...)
    #[serde(default, rename = "type")]
    pub bead_type: String,

    /// Priority (0 = highest); the store orders ready lists by this
    #[serde(default)]
    pub priority: u8,

    /// Ordered labels, including `grimoire:<name>` routing labels
    #[serde(default)]
    pub labels: Vec<String>,

    /// Ids of beads that must close before this one is ready
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Current lifecycle status
    pub status: BeadStatus,
}

impl Bead {
    /// Find a `grimoire:<name>` label, if any
    pub fn grimoire_label(&self) -> Option<&str> {
        self.labels.iter().find_map(|l| l.strip_prefix("grimoire:"))
    }
}
