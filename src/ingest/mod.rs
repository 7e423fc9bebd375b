//! Background bulk ingestion.
//!
//! Writes that tolerate latency are queued and shipped in bulk requests
//! sized by operation count, payload bytes, and a flush interval. Failed
//! flushes retry under a configurable [`BackoffPolicy`].

pub mod ingester;
pub mod tasks;

pub use ingester::BulkIngester;

use crate::error::{GriddleError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Retry schedule for a failed bulk flush.
///
/// Configured as a string: `nobackoff`, `constant(5s,3)`, `exponential`,
/// `exponential(1s,8)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPolicy {
    None,
    Constant { delay: Duration, max_retries: u32 },
    Exponential { delay: Duration, max_retries: u32 },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            delay: Duration::from_millis(50),
            max_retries: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` when the
    /// schedule is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            BackoffPolicy::None => None,
            BackoffPolicy::Constant { delay, max_retries } => {
                (attempt <= *max_retries).then_some(*delay)
            }
            BackoffPolicy::Exponential { delay, max_retries } => (attempt <= *max_retries)
                .then(|| delay.saturating_mul(1u32 << (attempt - 1).min(16))),
        }
    }
}

impl fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffPolicy::None => f.write_str("nobackoff"),
            BackoffPolicy::Constant { delay, max_retries } => {
                write!(f, "constant({}ms,{})", delay.as_millis(), max_retries)
            }
            BackoffPolicy::Exponential { delay, max_retries } => {
                write!(f, "exponential({}ms,{})", delay.as_millis(), max_retries)
            }
        }
    }
}

impl FromStr for BackoffPolicy {
    type Err = GriddleError;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("nobackoff") {
            return Ok(BackoffPolicy::None);
        }
        if input.eq_ignore_ascii_case("exponential") {
            return Ok(BackoffPolicy::default());
        }
        if input.eq_ignore_ascii_case("constant") {
            return Ok(BackoffPolicy::Constant {
                delay: Duration::from_secs(1),
                max_retries: 3,
            });
        }
        let (kind, args) = input
            .split_once('(')
            .and_then(|(kind, rest)| rest.strip_suffix(')').map(|args| (kind, args)))
            .ok_or_else(|| GriddleError::Config(format!("invalid backoff policy: {}", input)))?;
        let (delay_str, retries_str) = args
            .split_once(',')
            .ok_or_else(|| GriddleError::Config(format!("invalid backoff policy: {}", input)))?;
        let delay = crate::config::parse_duration(delay_str)?;
        let max_retries: u32 = retries_str
            .trim()
            .parse()
            .map_err(|_| GriddleError::Config(format!("invalid backoff retries: {}", input)))?;
        match kind.trim().to_ascii_lowercase().as_str() {
            "constant" => Ok(BackoffPolicy::Constant { delay, max_retries }),
            "exponential" => Ok(BackoffPolicy::Exponential { delay, max_retries }),
            _ => Err(GriddleError::Config(format!(
                "invalid backoff policy: {}",
                input
            ))),
        }
    }
}

impl Serialize for BackoffPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BackoffPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
