//! Shared service state
//!
//! Holds the event broadcaster used by every component. Session state itself
//! is never shared: each session is owned by its navigator actor.

use emx_common::events::SessionEvent;
use tokio::sync::broadcast;

pub struct SharedState {
    /// Event broadcaster for SSE listeners
    pub event_tx: broadcast::Sender<SessionEvent>,
}

impl SharedState {
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self { event_tx }
    }

    /// Broadcast an event to all SSE listeners
    pub fn broadcast_event(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    /// Subscribe to the event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(256)
    }
}
