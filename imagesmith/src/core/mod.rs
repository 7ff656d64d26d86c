//! Core types: build states, the job record, artifacts and events.

mod artifact;
mod event;
mod job;
mod state;

pub use artifact::{Artifact, ArtifactFile};
pub use event::{BuildEvent, EventKind, OutputStream};
pub use job::BuildJob;
pub use state::{BuildState, StateRecord};
