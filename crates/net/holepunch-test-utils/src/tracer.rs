use std::sync::Arc;

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};
use vertex_net_holepunch::{TraceEvent, Tracer};

#[derive(Default)]
struct Inner {
    events: Mutex<Vec<(Instant, TraceEvent)>>,
    notify: Notify,
}

/// Tracer that keeps every event along with when it was emitted.
///
/// Cheap to clone; clones share the recording.
#[derive(Clone, Default)]
pub struct RecordingTracer {
    inner: Arc<Inner>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.inner
            .events
            .lock()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn timed_events(&self) -> Vec<(Instant, TraceEvent)> {
        self.inner.events.lock().clone()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&TraceEvent) -> bool) -> usize {
        self.inner
            .events
            .lock()
            .iter()
            .filter(|(_, e)| predicate(e))
            .count()
    }

    /// First recorded event matching `predicate`, with its timestamp.
    pub fn find(&self, predicate: impl Fn(&TraceEvent) -> bool) -> Option<(Instant, TraceEvent)> {
        self.inner
            .events
            .lock()
            .iter()
            .find(|(_, e)| predicate(e))
            .cloned()
    }

    /// Waits until an event matching `predicate` has been recorded.
    pub async fn wait_for(&self, predicate: impl Fn(&TraceEvent) -> bool) -> TraceEvent {
        loop {
            let notified = self.inner.notify.notified();
            if let Some((_, event)) = self.find(&predicate) {
                return event;
            }
            notified.await;
        }
    }
}

impl Tracer for RecordingTracer {
    fn trace(&self, event: TraceEvent) {
        self.inner.events.lock().push((Instant::now(), event));
        self.inner.notify.notify_waiters();
    }
}
