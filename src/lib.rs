//! griddle: a tenant-scoped document persistence layer over an external
//! search backend.
//!
//! Items are JSON documents with a logical id, a type, and a tenant. The
//! store maps each type onto a physical index layout (dedicated, shared, or
//! rolling behind a write alias), encodes tenant and type into document ids,
//! and compiles a pluggable condition DSL into backend filters. Writes can
//! go through a background bulk ingester; long-running by-query operations
//! are polled to completion.
//!
//! ```no_run
//! use griddle::backend::memory::InMemoryBackend;
//! use griddle::condition::context::NoopScriptExecutor;
//! use griddle::config::StoreConfig;
//! use griddle::store::DocumentStore;
//! use griddle::types::{Item, TenantId};
//! use std::sync::Arc;
//!
//! # async fn example() -> griddle::error::Result<()> {
//! let store = DocumentStore::new(
//!     Arc::new(InMemoryBackend::new()),
//!     StoreConfig::default(),
//!     Arc::new(NoopScriptExecutor),
//! );
//! store.bring_up().await?;
//!
//! let tenant = TenantId::new("acme");
//! let mut profile = Item::new(
//!     "p1",
//!     "profile",
//!     tenant.clone(),
//!     serde_json::json!({"properties": {"city": "Paris"}}),
//! );
//! store.save(&mut profile).await?;
//! let loaded = store.load(&tenant, "profile", "p1").await?;
//! assert!(loaded.is_some());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod condition;
pub mod config;
pub mod error;
pub mod index;
pub mod ingest;
pub mod query;
pub mod store;
pub mod types;

pub use condition::availability::BuilderAvailability;
pub use condition::dispatcher::{ConditionQueryBuilder, QueryBuilderDispatcher};
pub use condition::{Condition, ConditionType, ParamValue};
pub use config::StoreConfig;
pub use error::{GriddleError, Result};
pub use query::Query;
pub use store::DocumentStore;
pub use types::{Item, ItemMeta, TenantId};
