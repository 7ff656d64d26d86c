//! Event sinks for the progress log and observability.
//!
//! Every build emits [`BuildEvent`](crate::core::BuildEvent)s through an
//! [`EventSink`]. The command-line front end uses [`ConsoleEventSink`] for the
//! stage-tagged progress log; tests use [`CollectingEventSink`].

mod sink;

pub use sink::{
    CollectingEventSink, ConsoleEventSink, EventSink, LoggingEventSink, NoOpEventSink,
};

use std::sync::Arc;

/// Fans one event out to several sinks, in order.
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for FanoutEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl FanoutEventSink {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait::async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: &crate::core::BuildEvent) {
        for sink in &self.sinks {
            sink.emit(event).await;
        }
    }

    fn try_emit(&self, event: &crate::core::BuildEvent) {
        for sink in &self.sinks {
            sink.try_emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BuildEvent, BuildState, EventKind};

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let a = Arc::new(CollectingEventSink::new());
        let b = Arc::new(CollectingEventSink::new());
        let fanout = FanoutEventSink::new()
            .with_sink(a.clone())
            .with_sink(b.clone());

        let event = BuildEvent::new(
            uuid::Uuid::nil(),
            "rhel9",
            BuildState::Init,
            EventKind::StateEntered,
        );
        fanout.emit(&event).await;
        fanout.try_emit(&event);

        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
    }
}
