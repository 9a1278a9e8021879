//! Question - a mid-run prompt from an agent awaiting a human answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A question raised by an agent while working a bead
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    /// Question identity
    pub id: String,

    /// Bead whose agent asked
    pub task_id: String,

    /// Prompt text shown to the user
    pub text: String,

    /// Optional fixed answer choices
    #[serde(default)]
    pub options: Option<Vec<String>>,

    /// The answer, once given
    #[serde(default)]
    pub answer: Option<String>,

    /// When the agent asked
    pub asked_at: DateTime<Utc>,
}

impl Question {
    /// New unanswered question for a bead
    pub fn new(task_id: impl Into<String>, text: impl Into<String>, options: Option<Vec<String>>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            task_id: task_id.into(),
            text: text.into(),
            options,
            answer: None,
            asked_at: Utc::now(),
        }
    }
}
