//! Human-friendly duration parsing for stream timeouts.
//!
//! Accepts `"10s"`, `"5m"`, `"1h"`, and bare second counts (`"300"`).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration: {0}")]
pub struct DurationParseError(pub String);

/// Parse a duration string.
pub fn parse_duration(s: &str) -> Result<Duration, DurationParseError> {
    let s = s.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err(DurationParseError(s));
    }

    let (digits, multiplier) = if let Some(rest) = s.strip_suffix('s') {
        (rest, 1)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3600)
    } else {
        (s.as_str(), 1)
    };

    digits
        .parse::<u64>()
        .map(|n| Duration::from_secs(n * multiplier))
        .map_err(|_| DurationParseError(s.clone()))
}
