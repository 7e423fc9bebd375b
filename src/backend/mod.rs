//! Search backend abstraction.
//!
//! The physical document store is an external HTTP service (index/get/
//! update/delete, bulk, search, by-query operations returning async task
//! ids, template and lifecycle-policy management, task polling). This crate
//! does not reimplement that wire contract; it talks to it through
//! [`SearchBackend`], and ships [`memory::InMemoryBackend`] for embedding
//! and tests.

pub mod memory;

use crate::error::Result;
use crate::query::Query;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-write behavior: optimistic concurrency tokens, create-only semantics
/// and the refresh policy applied by the backend after the write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub if_seq_no: Option<u64>,
    pub if_primary_term: Option<u64>,
    /// Fail with a conflict when the document already exists.
    pub create_only: bool,
    pub refresh: RefreshPolicy,
}

/// When a write becomes visible to searches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Visibility follows the backend's refresh interval.
    #[default]
    None,
    /// Refresh immediately after the write.
    Immediate,
    /// Block the write until the next scheduled refresh.
    WaitFor,
}

/// Backend acknowledgement of a single-document write.
#[derive(Debug, Clone)]
pub struct WriteResponse {
    pub id: String,
    pub index: String,
    pub seq_no: u64,
    pub primary_term: u64,
    pub created: bool,
}

/// A fetched document with its concurrency tokens and physical index.
#[derive(Debug, Clone)]
pub struct GetResult {
    pub id: String,
    pub index: String,
    pub seq_no: u64,
    pub primary_term: u64,
    pub source: Value,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub index: String,
    pub seq_no: u64,
    pub primary_term: u64,
    pub source: Value,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub total: u64,
}

/// One operation in a bulk request.
#[derive(Debug, Clone)]
pub enum BulkOp {
    Index {
        index: String,
        id: String,
        document: Value,
        options: WriteOptions,
    },
    Update {
        index: String,
        id: String,
        doc: Value,
        options: WriteOptions,
    },
    Delete {
        index: String,
        id: String,
    },
}

impl BulkOp {
    /// Rough wire size, used by the ingester's byte-based flush threshold.
    pub fn estimated_bytes(&self) -> usize {
        match self {
            BulkOp::Index { document, .. } => {
                serde_json::to_string(document).map(|s| s.len()).unwrap_or(0)
            }
            BulkOp::Update { doc, .. } => serde_json::to_string(doc).map(|s| s.len()).unwrap_or(0),
            BulkOp::Delete { .. } => 64,
        }
    }
}

/// Status of a long-running backend task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub task_id: String,
    pub completed: bool,
}

/// An alias target: one physical index, possibly the write index.
#[derive(Debug, Clone)]
pub struct AliasTarget {
    pub index: String,
    pub is_write_index: bool,
}

/// An alias to attach at index creation.
#[derive(Debug, Clone)]
pub struct AliasSpec {
    pub alias: String,
    pub is_write_index: bool,
}

impl AliasSpec {
    pub fn write(alias: impl Into<String>) -> Self {
        AliasSpec {
            alias: alias.into(),
            is_write_index: true,
        }
    }
}

/// The external document store contract.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn get(&self, index: &str, id: &str) -> Result<Option<GetResult>>;

    async fn index(
        &self,
        index: &str,
        id: &str,
        document: &Value,
        options: &WriteOptions,
    ) -> Result<WriteResponse>;

    /// Partial document update (merge semantics).
    async fn update(
        &self,
        index: &str,
        id: &str,
        doc: &Value,
        options: &WriteOptions,
    ) -> Result<WriteResponse>;

    /// `index` may be a concrete name, an alias, or a trailing-`*` wildcard:
    /// rolling types delete across every generation, so implementations must
    /// fan the pattern out rather than hand it to a single-index delete API.
    async fn delete(&self, index: &str, id: &str) -> Result<bool>;

    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<()>;

    /// `index` may be a concrete name, an alias, or a trailing-`*` wildcard.
    async fn search(&self, index: &str, query: &Query, size: usize) -> Result<SearchResults>;

    async fn count(&self, index: &str, query: &Query) -> Result<u64>;

    /// Submits an asynchronous delete-by-query; returns the task id.
    async fn delete_by_query(&self, index: &str, query: &Query) -> Result<String>;

    /// Submits an asynchronous scripted update-by-query; returns the task id.
    async fn update_by_query(
        &self,
        index: &str,
        query: &Query,
        script: &str,
        params: &Value,
    ) -> Result<String>;

    async fn task_status(&self, task_id: &str) -> Result<TaskInfo>;

    async fn create_index(
        &self,
        name: &str,
        settings: &Value,
        aliases: &[AliasSpec],
    ) -> Result<()>;

    async fn delete_index(&self, name: &str) -> Result<bool>;

    async fn index_exists(&self, name: &str) -> Result<bool>;

    /// Physical indices behind an alias, write index flagged.
    async fn resolve_alias(&self, alias: &str) -> Result<Vec<AliasTarget>>;

    async fn put_index_template(&self, name: &str, body: &Value) -> Result<()>;

    async fn index_template_exists(&self, name: &str) -> Result<bool>;

    /// Effective (template-merged) settings of a concrete index.
    async fn get_index_settings(&self, index: &str) -> Result<Value>;

    async fn put_lifecycle_policy(&self, name: &str, body: &Value) -> Result<bool>;

    async fn lifecycle_policy_exists(&self, name: &str) -> Result<bool>;
}
