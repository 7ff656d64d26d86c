//! Observability utilities.

mod timer;

pub use timer::{build_span, StateTimer};
