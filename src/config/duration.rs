//! Duration parameters with unit suffixes.
//!
//! Values accept `ms`, `s`, `m` and `h` suffixes. A unit-less zero is
//! accepted everywhere and read as seconds — configurations written
//! against the legacy loader depend on that. Non-zero values without a
//! unit are rejected in strict mode; otherwise they are read as seconds
//! and logged.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("invalid duration value '{0}'")]
    Invalid(String),

    #[error("duration value '{0}' has no unit; specify one of ms, s, m, h")]
    MissingUnit(String),
}

/// A duration parameter as read from the configuration file
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct DurationValue(pub String);

impl DurationValue {
    pub fn from_secs(secs: u64) -> Self {
        DurationValue(format!("{}s", secs))
    }

    /// Resolve to a concrete duration under the given strictness
    pub fn resolve(&self, strict: bool) -> Result<Duration, DurationError> {
        parse_duration(&self.0, strict)
    }
}

pub fn parse_duration(raw: &str, strict: bool) -> Result<Duration, DurationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DurationError::Invalid(raw.to_string()));
    }

    let (digits, unit) = split_unit(raw);
    let value: u64 = digits
        .parse()
        .map_err(|_| DurationError::Invalid(raw.to_string()))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "" => {
            // A zero reads the same in any unit; keep accepting it the way
            // the legacy loader did.
            if value == 0 {
                return Ok(Duration::ZERO);
            }
            if strict {
                return Err(DurationError::MissingUnit(raw.to_string()));
            }
            warn!(
                value = raw,
                "duration has no unit, interpreting as seconds"
            );
            Ok(Duration::from_secs(value))
        }
        _ => Err(DurationError::Invalid(raw.to_string())),
    }
}

fn split_unit(raw: &str) -> (&str, &str) {
    let end = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    (&raw[..end], &raw[end..])
}
