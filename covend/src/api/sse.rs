//! Server-sent event stream.
//!
//! Every client gets an authoritative `state.snapshot` first, then the live
//! event feed. A subscriber that lags past its broadcast backlog is
//! disconnected (the stream ends) instead of back-pressuring producers; the
//! client reconnects and starts from a fresh snapshot. A global heartbeat
//! re-publishes `state.snapshot` periodically as proof of liveness.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, Sse};
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::events::{Event, EventBus};
use crate::state::StateStore;

use super::AppState;

fn sse_event(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default().event(event.event_type()).data(data)
}

/// `GET /events` - snapshot-first event stream
pub async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    // Snapshot and subscription are taken in one critical region, so no
    // event published before this snapshot can appear on the stream
    let (snapshot, rx) = state.store.snapshot_and_subscribe();
    info!("SSE client connected");

    let first = Event::StateSnapshot { snapshot };
    let initial = stream::once(async move { Ok(sse_event(&first)) });

    let live = stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => Some((Ok(sse_event(&event)), rx)),
            Err(RecvError::Lagged(missed)) => {
                // Slow client: cut the stream rather than stall the bus
                debug!(missed, "SSE client lagged, disconnecting");
                None
            }
            Err(RecvError::Closed) => None,
        }
    });

    Sse::new(initial.chain(live))
}

/// Periodically republish the full snapshot as a liveness heartbeat
pub fn spawn_snapshot_heartbeat(store: Arc<StateStore>, bus: Arc<EventBus>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            bus.emit(Event::StateSnapshot {
                snapshot: store.snapshot(),
            });
        }
    })
}
