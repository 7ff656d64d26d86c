//! Utility functions for identifiers, timestamps, durations and paths.

pub mod duration;
pub mod paths;
pub mod timestamps;

pub use duration::{parse_duration, DurationParseError};
pub use paths::strip_local_prefix;
pub use timestamps::{format_timestamp, iso_timestamp, now_utc, Timestamp};

use uuid::Uuid;

/// Generates a new time-ordered build identifier (UUID v7).
#[must_use]
pub fn generate_build_id() -> Uuid {
    Uuid::now_v7()
}
