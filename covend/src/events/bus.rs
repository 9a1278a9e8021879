//! Event bus - central pub/sub for daemon events.
//!
//! A tokio broadcast channel fans every event out to all subscribers.
//! Publishing is fire-and-forget: no subscribers is fine, and a subscriber
//! that falls behind sees `Lagged` and is expected to drop itself (the SSE
//! relay disconnects such clients rather than back-pressuring producers).

use tokio::sync::broadcast;
use tracing::debug;

use super::Event;

/// Default channel capacity (events per subscriber backlog)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Central event bus
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given backlog capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: Event) {
        debug!(event_type = event.event_type(), task_id = ?event.task_id(), "EventBus::emit");
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(Event::AgentOutput {
            task_id: "bd-1".to_string(),
            line: "hi".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "agent.output");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(Event::AgentOutput {
            task_id: "bd-1".to_string(),
            line: "dropped".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_everything() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(Event::WorkflowCompleted {
            workflow_id: "wf-bd-1-1".to_string(),
            task_id: "bd-1".to_string(),
        });

        assert_eq!(rx1.recv().await.unwrap().event_type(), "workflow.completed");
        assert_eq!(rx2.recv().await.unwrap().event_type(), "workflow.completed");
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for i in 0..10 {
            bus.emit(Event::AgentOutput {
                task_id: "bd-1".to_string(),
                line: format!("line {i}"),
            });
        }

        // The backlog overflowed; the subscriber learns it lagged instead of
        // stalling the publisher
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            Ok(_) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }
}
