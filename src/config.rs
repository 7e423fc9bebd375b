//! Store configuration.
//!
//! Deserializes from the deployment's config file with serde; every field
//! has a production default so an empty document is a valid configuration.
//! Durations and byte sizes are written in human form (`"5s"`, `"5MB"`).

use crate::backend::RefreshPolicy;
use crate::error::{GriddleError, Result};
use crate::ingest::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// Prefix of every index this deployment owns.
    pub index_prefix: String,
    /// Rethrow internal errors instead of swallowing and logging them.
    pub throw_exceptions: bool,
    /// Skip optimistic-concurrency tokens on save; last write wins.
    pub always_overwrite: bool,
    pub use_batching_for_save: bool,
    pub use_batching_for_update: bool,
    /// Substrings that classify a backend error as unrecoverable.
    pub fatal_illegal_state_errors: Vec<String>,
    /// Item types stored in rolling indices.
    pub rollover_indices: Vec<String>,
    /// Per-item-type refresh policy for synchronous writes.
    pub refresh_policies: HashMap<String, RefreshPolicy>,
    /// Shards for dedicated and shared indices; rolling indices use
    /// [`RolloverConfig`].
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    pub mapping_total_fields_limit: u32,
    pub default_query_limit: usize,
    pub ingest: IngestConfig,
    pub rollover: RolloverConfig,
    pub task: TaskConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            index_prefix: "context".into(),
            throw_exceptions: false,
            always_overwrite: true,
            use_batching_for_save: false,
            use_batching_for_update: true,
            fatal_illegal_state_errors: Vec::new(),
            rollover_indices: vec!["event".into(), "session".into()],
            refresh_policies: HashMap::new(),
            number_of_shards: 5,
            number_of_replicas: 0,
            mapping_total_fields_limit: 1000,
            default_query_limit: 10,
            ingest: IngestConfig::default(),
            rollover: RolloverConfig::default(),
            task: TaskConfig::default(),
        }
    }
}

/// Bulk ingester thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IngestConfig {
    /// Flush after this many queued operations.
    pub bulk_actions: usize,
    /// Flush after the queued payload reaches this size.
    #[serde(with = "byte_size")]
    pub bulk_size: usize,
    /// Flush at least this often regardless of volume.
    #[serde(with = "duration_str")]
    pub flush_interval: Duration,
    pub backoff_policy: BackoffPolicy,
    /// Queued operations before senders start failing fast.
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            bulk_actions: 1000,
            bulk_size: 5 * 1024 * 1024,
            flush_interval: Duration::from_secs(5),
            backoff_policy: BackoffPolicy::default(),
            queue_capacity: 10_000,
        }
    }
}

/// Rolling-index layout and bring-up behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RolloverConfig {
    pub max_age: Option<String>,
    pub max_size: Option<String>,
    pub max_docs: Option<u64>,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    pub mapping_total_fields_limit: u32,
    pub max_doc_value_fields_search: u32,
    /// Attempts to verify a freshly created index picked up its template.
    pub bring_up_attempts: u32,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        RolloverConfig {
            max_age: None,
            max_size: Some("30gb".into()),
            max_docs: None,
            number_of_shards: 5,
            number_of_replicas: 0,
            mapping_total_fields_limit: 1000,
            max_doc_value_fields_search: 1000,
            bring_up_attempts: 5,
        }
    }
}

/// Long-running backend task polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(with = "duration_str")]
    pub wait_timeout: Duration,
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            wait_timeout: Duration::from_millis(3_600_000),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Parses `"500ms"`, `"5s"`, `"2m"`, `"1h"`. A bare number is milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| GriddleError::Config(format!("invalid duration: {}", input)))?;
    match unit {
        "" | "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(GriddleError::Config(format!("invalid duration: {}", input))),
    }
}

/// Parses `"5MB"`, `"512KB"`, `"1GB"`. A bare number is bytes.
pub fn parse_byte_size(input: &str) -> Result<usize> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: usize = digits
        .parse()
        .map_err(|_| GriddleError::Config(format!("invalid byte size: {}", input)))?;
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        _ => {
            return Err(GriddleError::Config(format!(
                "invalid byte size: {}",
                input
            )))
        }
    };
    Ok(value * multiplier)
}

mod duration_str {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod byte_size {
    use super::parse_byte_size;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(size: &usize, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&size.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_byte_size(&raw).map_err(serde::de::Error::custom)
    }
}
