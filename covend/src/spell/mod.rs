//! Spells - prompt templates rendered for agent steps.

mod loader;

pub use loader::{SpellError, SpellLoader};
