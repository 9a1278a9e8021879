//! Core domain records: beads (tasks), agent runs, and questions.

mod agent;
mod bead;
mod question;

pub use agent::{AgentRecord, AgentStatus};
pub use bead::{Bead, BeadStatus};
pub use question::Question;
