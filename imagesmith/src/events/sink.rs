//! Event sink trait and implementations.

use crate::core::BuildEvent;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::io::Write;
use tracing::{debug, info, warn, Level};

/// Receives build events.
///
/// Sinks receive events that were already redacted; a sink never sees a
/// sensitive value.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event: &BuildEvent);

    /// Emits an event without awaiting.
    ///
    /// Never fails; errors are logged and suppressed.
    fn try_emit(&self, event: &BuildEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &BuildEvent) {}

    fn try_emit(&self, _event: &BuildEvent) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &BuildEvent) {
        let text = event.text();
        if event.event_type() == "build.warning" {
            warn!(
                build_id = %event.build_id,
                guest = %event.guest,
                state = %event.state,
                "{}", text
            );
            return;
        }
        if self.level == Level::DEBUG {
            debug!(
                build_id = %event.build_id,
                guest = %event.guest,
                state = %event.state,
                event_type = event.event_type(),
                "{}", text
            );
        } else {
            info!(
                build_id = %event.build_id,
                guest = %event.guest,
                state = %event.state,
                event_type = event.event_type(),
                "{}", text
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &BuildEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &BuildEvent) {
        self.log_event(event);
    }
}

/// Writes the stage-tagged progress log.
///
/// Each event becomes one line: `==> <guest>: [<state>] <text>`.
pub struct ConsoleEventSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for ConsoleEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleEventSink").finish_non_exhaustive()
    }
}

impl Default for ConsoleEventSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl ConsoleEventSink {
    /// Writes to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::with_writer(std::io::stdout())
    }

    /// Writes to the given writer.
    #[must_use]
    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Renders one progress line.
    #[must_use]
    pub fn format_line(event: &BuildEvent) -> String {
        format!("==> {}: [{}] {}", event.guest, event.state, event.text())
    }

    fn write_event(&self, event: &BuildEvent) {
        let line = Self::format_line(event);
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            debug!(error = %e, "Failed to write progress line");
        }
    }
}

#[async_trait]
impl EventSink for ConsoleEventSink {
    async fn emit(&self, event: &BuildEvent) {
        self.write_event(event);
    }

    fn try_emit(&self, event: &BuildEvent) {
        self.write_event(event);
    }
}

/// Records events for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<BuildEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<BuildEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// All event texts, rendered the way the progress log shows them.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .map(ConsoleEventSink::format_line)
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &BuildEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &BuildEvent) {
        self.events.write().push(event.clone());
    }
}
