//! State store - authoritative in-memory view of beads, agents, questions,
//! and workflow runs.

mod store;

pub use store::{StateSnapshot, StateStore};
