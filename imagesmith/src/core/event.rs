//! Build events for the progress log and observability.

use super::BuildState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which stream a remote output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// The job entered its current state.
    StateEntered,
    /// The job left a state.
    StateCompleted {
        /// Time spent in the state.
        duration_ms: f64,
    },
    /// Free-form progress message.
    Message {
        /// Already-redacted text.
        text: String,
    },
    /// One line of remote provisioner output.
    Output {
        /// Source stream.
        stream: OutputStream,
        /// Already-redacted line.
        line: String,
    },
    /// Something went wrong but the build continues (e.g. a cleanup step).
    Warning {
        /// Already-redacted text.
        text: String,
    },
    /// The build failed.
    Failed {
        /// Taxonomy entry.
        error_kind: String,
        /// Already-redacted message.
        message: String,
    },
}

/// An event emitted by a build while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    /// The build.
    pub build_id: Uuid,
    /// Guest name, used as the progress-log tag.
    pub guest: String,
    /// State the job was in.
    pub state: BuildState,
    /// When the event occurred (RFC 3339).
    pub timestamp: String,
    /// Payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl BuildEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(build_id: Uuid, guest: impl Into<String>, state: BuildState, kind: EventKind) -> Self {
        Self {
            build_id,
            guest: guest.into(),
            state,
            timestamp: crate::utils::iso_timestamp(),
            kind,
        }
    }

    /// Dotted event type name (e.g. "state.entered").
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::StateEntered => "state.entered",
            EventKind::StateCompleted { .. } => "state.completed",
            EventKind::Message { .. } => "build.message",
            EventKind::Output { .. } => "remote.output",
            EventKind::Warning { .. } => "build.warning",
            EventKind::Failed { .. } => "build.failed",
        }
    }

    /// Human text for the progress log.
    #[must_use]
    pub fn text(&self) -> String {
        match &self.kind {
            EventKind::StateEntered => format!("entering {}", self.state),
            EventKind::StateCompleted { duration_ms } => {
                format!("{} completed in {:.1}s", self.state, duration_ms / 1000.0)
            }
            EventKind::Message { text } => text.clone(),
            EventKind::Output { stream, line } => match stream {
                OutputStream::Stdout => format!("    {line}"),
                OutputStream::Stderr => format!("    ! {line}"),
            },
            EventKind::Warning { text } => format!("warning: {text}"),
            EventKind::Failed { error_kind, message } => format!("{error_kind}: {message}"),
        }
    }
}
