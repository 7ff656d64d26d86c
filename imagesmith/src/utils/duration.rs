//! Human duration strings (`"10s"`, `"30m"`, `"1m30s"`, `"500ms"`).

use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;

/// Errors produced while parsing a duration string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DurationParseError {
    /// The input was empty.
    #[error("empty duration")]
    Empty,

    /// A number was not followed by a known unit, or a unit had no number.
    #[error("invalid duration '{0}': expected e.g. 500ms, 10s, 30m, 1h, 1m30s")]
    Invalid(String),
}

/// Parses a duration made of `<number><unit>` groups.
///
/// Units are `ms`, `s`, `m` and `h`. A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }
    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let secs = trimmed
            .parse::<u64>()
            .map_err(|_| DurationParseError::Invalid(input.to_string()))?;
        return Ok(Duration::from_secs(secs));
    }

    let invalid = || DurationParseError::Invalid(input.to_string());
    let bytes = trimmed.as_bytes();
    let mut total = Duration::ZERO;
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if start == i {
            return Err(invalid());
        }
        let value: u64 = trimmed[start..i].parse().map_err(|_| invalid())?;

        let unit_start = i;
        while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        let part = match &trimmed[unit_start..i] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            _ => return Err(invalid()),
        };
        total = total.saturating_add(part);
    }

    Ok(total)
}

/// Serde adapter for `Duration` fields written as human strings.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Serde adapter for `Option<Duration>` fields written as human strings.
pub fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    s.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}
