//! Typed event bus: lock and intent events fanned out to all subscribers

use coedit_core::CoordinationEvent;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast bus for `CoordinationEvent`s. Cheap to clone; every clone
/// publishes into the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoordinationEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: CoordinationEvent) {
        debug!(event = event.name(), block = event.block_id(), "publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.tx.subscribe()
    }
}
