//! Scheduler - the reconciliation loop that turns ready beads into running
//! workflows within the concurrency cap.

mod core;

pub use core::{ApproveError, ApproveOutcome, Scheduler, SchedulerDeps};
