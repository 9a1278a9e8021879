//! Grimoires - declarative step programs executed by the workflow runner.

mod library;
mod step;

pub use library::{GrimoireError, Library};
pub use step::{Grimoire, OnFail, OnMaxIterations, OnSuccess, StepDef, StepKind};
