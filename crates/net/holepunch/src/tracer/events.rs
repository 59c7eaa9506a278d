//! Broadcast tracer.

use tokio::sync::broadcast;

use super::{TraceEvent, Tracer};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Non-blocking broadcast of trace events. Slow subscribers drop events independently.
#[derive(Debug, Clone)]
pub struct EventTracer {
    tx: broadcast::Sender<TraceEvent>,
}

impl EventTracer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventTracer {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Tracer for EventTracer {
    fn trace(&self, event: TraceEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
