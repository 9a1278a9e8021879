//! Events - the daemon's activity vocabulary and pub/sub bus.

mod bus;
mod types;

pub use bus::{EventBus, DEFAULT_CHANNEL_CAPACITY};
pub use types::{truncate_output, Event, MAX_EVENT_OUTPUT};
