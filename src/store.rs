//! The tenant-scoped document store.
//!
//! [`DocumentStore`] is the facade the rest of the platform talks to: typed
//! item CRUD, condition-driven queries, by-query bulk operations, and the
//! background bulk ingester, all routed through the index layout and the
//! document-id codec. Every operation is scoped to a tenant; queries against
//! shared indices additionally constrain the item type so tenants and types
//! never bleed into each other.
//!
//! Error disposition follows the configured policy: production deployments
//! swallow and log non-fatal backend errors, reporting failure through the
//! boolean/optional return values, while development setups rethrow.

use crate::backend::{BulkOp, RefreshPolicy, SearchBackend, WriteOptions};
use crate::condition::context::ScriptExecutor;
use crate::condition::dispatcher::QueryBuilderDispatcher;
use crate::condition::{Condition, Context};
use crate::config::StoreConfig;
use crate::error::{ErrorPolicy, GriddleError, Result};
use crate::index::{codec, rollover, IndexRouter, Placement, TypeRegistry};
use crate::ingest::{tasks, BulkIngester};
use crate::query::{wrap_with_tenant_and_item_type, Query};
use crate::types::{Item, TenantId};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct DocumentStore {
    backend: Arc<dyn SearchBackend>,
    router: Arc<IndexRouter>,
    dispatcher: Arc<QueryBuilderDispatcher>,
    ingester: BulkIngester,
    config: StoreConfig,
    policy: ErrorPolicy,
}

impl DocumentStore {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        config: StoreConfig,
        script_executor: Arc<dyn ScriptExecutor>,
    ) -> Self {
        let registry =
            TypeRegistry::default().with_rolling_types(config.rollover_indices.iter().cloned());
        let router = Arc::new(IndexRouter::new(config.index_prefix.clone(), registry));
        let dispatcher = Arc::new(QueryBuilderDispatcher::new(script_executor));
        let ingester = BulkIngester::new(Arc::clone(&backend), config.ingest.clone());
        let policy = ErrorPolicy::new(
            config.throw_exceptions,
            config.fatal_illegal_state_errors.clone(),
        );
        DocumentStore {
            backend,
            router,
            dispatcher,
            ingester,
            config,
            policy,
        }
    }

    /// Replaces the error policy, typically to install a shutdown hook.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn dispatcher(&self) -> &QueryBuilderDispatcher {
        &self.dispatcher
    }

    pub fn router(&self) -> &IndexRouter {
        &self.router
    }

    /// Provisions rolling indices and the shared base indices. Idempotent;
    /// call once at startup before accepting writes.
    pub async fn bring_up(&self) -> Result<()> {
        rollover::bring_up(self.backend.as_ref(), &self.router, &self.config.rollover).await?;
        self.seed_write_index_cache().await?;
        for name in ["profile", "rule"] {
            self.ensure_index_for_type(name).await?;
        }
        Ok(())
    }

    /// Creates the (dedicated or shared) index for a type when missing, with
    /// the regular settings and the same folding analyzer the rolling
    /// templates carry.
    pub async fn ensure_index_for_type(&self, item_type: &str) -> Result<()> {
        if self.router.placement(item_type) == Placement::Rolling {
            return Ok(());
        }
        let index = self.router.base_name(item_type);
        if self.backend.index_exists(&index).await? {
            return Ok(());
        }
        let settings = json!({
            "settings": {
                "number_of_shards": self.config.number_of_shards,
                "number_of_replicas": self.config.number_of_replicas,
                "mapping": {"total_fields": {"limit": self.config.mapping_total_fields_limit}},
                "analysis": {
                    "analyzer": {
                        "folding": {
                            "type": "custom",
                            "tokenizer": "keyword",
                            "filter": ["lowercase", "asciifolding"]
                        }
                    }
                }
            }
        });
        self.backend.create_index(&index, &settings, &[]).await?;
        tracing::info!(index = %index, "created base index");
        Ok(())
    }

    /// Primes the rolling write-index cache from alias resolution so the
    /// first point reads after startup skip the wildcard.
    async fn seed_write_index_cache(&self) -> Result<()> {
        let rolling: Vec<String> = self
            .router
            .registry()
            .rolling_types()
            .map(String::from)
            .collect();
        for item_type in rolling {
            let alias = self.router.base_name(&item_type);
            let targets = self.backend.resolve_alias(&alias).await?;
            if let Some(write) = targets.iter().find(|t| t.is_write_index) {
                self.router.record_write_index(&item_type, &write.index);
            }
        }
        Ok(())
    }

    /// Flushes the bulk ingester and stops its worker.
    pub async fn shutdown(self) -> Result<()> {
        self.ingester.close().await
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// Loads one item by logical id, or `None` when it does not exist (a
    /// missing index counts as not existing).
    pub async fn load(
        &self,
        tenant: &TenantId,
        item_type: &str,
        item_id: &str,
    ) -> Result<Option<Item>> {
        let result = self.load_inner(tenant, item_type, item_id).await;
        Ok(self.policy.handle("load", result)?.flatten())
    }

    async fn load_inner(
        &self,
        tenant: &TenantId,
        item_type: &str,
        item_id: &str,
    ) -> Result<Option<Item>> {
        let placement = self.router.placement(item_type);
        let doc_id = codec::document_id(tenant, item_id, item_type, placement);

        if placement == Placement::Rolling {
            // Point reads against a rolling type usually hit the current
            // write index; try the cached one before fanning out.
            if let Some(latest) = self.router.latest_write_index(item_type) {
                let cached = self
                    .swallow_missing_index(self.backend.get(&latest, &doc_id).await)?
                    .flatten();
                if let Some(result) = cached {
                    return Ok(Some(codec::item_from_get(
                        result, tenant, item_type, placement,
                    )));
                }
            }
            let results = match self.swallow_missing_index(
                self.backend
                    .search(
                        &self.router.read_index(item_type),
                        &Query::ids([doc_id]),
                        1,
                    )
                    .await,
            )? {
                Some(results) => results,
                None => return Ok(None),
            };
            return Ok(results
                .hits
                .into_iter()
                .next()
                .map(|hit| codec::item_from_hit(hit, tenant, item_type, placement)));
        }

        let result = self
            .swallow_missing_index(
                self.backend
                    .get(&self.router.read_index(item_type), &doc_id)
                    .await,
            )?
            .flatten();
        Ok(result.map(|r| codec::item_from_get(r, tenant, item_type, placement)))
    }

    /// Persists an item, refreshing its storage metadata on success.
    ///
    /// With `always_overwrite` disabled the write is conditional: items that
    /// carry concurrency tokens replay them, items without tokens are
    /// create-only. Returns whether the write succeeded.
    pub async fn save(&self, item: &mut Item) -> Result<bool> {
        let result = self.save_inner(item).await;
        Ok(self.policy.handle("save", result)?.is_some())
    }

    async fn save_inner(&self, item: &mut Item) -> Result<()> {
        let placement = self.router.placement(&item.item_type);
        let doc_id = codec::document_id(&item.tenant_id, &item.item_id, &item.item_type, placement);
        let source = codec::to_source(item);
        let options = self.save_options(item);
        let index = self.write_target(item, placement);

        if self.config.use_batching_for_save {
            return self.ingester.submit(BulkOp::Index {
                index,
                id: doc_id,
                document: source,
                options,
            });
        }

        let response = self.backend.index(&index, &doc_id, &source, &options).await?;
        item.meta.seq_no = Some(response.seq_no);
        item.meta.primary_term = Some(response.primary_term);
        item.meta.index = Some(response.index.clone());
        item.meta.tenant_id = Some(item.tenant_id.clone());
        self.router
            .record_write_index(&item.item_type, &response.index);
        Ok(())
    }

    /// Applies a partial document to an item. Merge semantics: nested
    /// objects merge, scalars replace. Returns whether the update succeeded.
    pub async fn update(&self, item: &Item, doc: Value) -> Result<bool> {
        let result = self.update_inner(item, doc).await;
        Ok(self.policy.handle("update", result)?.is_some())
    }

    async fn update_inner(&self, item: &Item, doc: Value) -> Result<()> {
        let placement = self.router.placement(&item.item_type);
        let doc_id = codec::document_id(&item.tenant_id, &item.item_id, &item.item_type, placement);
        let index = self.write_target(item, placement);
        let options = WriteOptions {
            refresh: self.refresh_for(&item.item_type),
            ..WriteOptions::default()
        };

        if self.config.use_batching_for_update {
            return self.ingester.submit(BulkOp::Update {
                index,
                id: doc_id,
                doc,
                options,
            });
        }
        self.backend.update(&index, &doc_id, &doc, &options).await?;
        Ok(())
    }

    /// Removes one item. Returns whether a document was deleted.
    pub async fn delete(
        &self,
        tenant: &TenantId,
        item_type: &str,
        item_id: &str,
    ) -> Result<bool> {
        let result = self.delete_inner(tenant, item_type, item_id).await;
        Ok(self.policy.handle("delete", result)?.unwrap_or(false))
    }

    async fn delete_inner(
        &self,
        tenant: &TenantId,
        item_type: &str,
        item_id: &str,
    ) -> Result<bool> {
        let placement = self.router.placement(item_type);
        let doc_id = codec::document_id(tenant, item_id, item_type, placement);
        self.backend
            .delete(&self.router.read_index(item_type), &doc_id)
            .await
    }

    // ------------------------------------------------------------------
    // Condition-driven operations
    // ------------------------------------------------------------------

    /// Items of one type matching a condition, tenant-scoped.
    pub async fn query(
        &self,
        tenant: &TenantId,
        item_type: &str,
        condition: &Condition,
        size: Option<usize>,
    ) -> Result<Vec<Item>> {
        let result = self.query_inner(tenant, item_type, condition, size).await;
        Ok(self.policy.handle("query", result)?.unwrap_or_default())
    }

    async fn query_inner(
        &self,
        tenant: &TenantId,
        item_type: &str,
        condition: &Condition,
        size: Option<usize>,
    ) -> Result<Vec<Item>> {
        let filter = self
            .dispatcher
            .build_filter(condition, &mut Context::new())?;
        self.search(tenant, item_type, filter, size).await
    }

    /// Items of one type matching a prebuilt filter, tenant-scoped.
    pub async fn search(
        &self,
        tenant: &TenantId,
        item_type: &str,
        filter: Query,
        size: Option<usize>,
    ) -> Result<Vec<Item>> {
        let placement = self.router.placement(item_type);
        let scoped = wrap_with_tenant_and_item_type(
            filter,
            tenant,
            self.router.item_type_constraint(item_type),
        );
        let results = match self.swallow_missing_index(
            self.backend
                .search(
                    &self.router.read_index(item_type),
                    &scoped,
                    size.unwrap_or(self.config.default_query_limit),
                )
                .await,
        )? {
            Some(results) => results,
            None => return Ok(Vec::new()),
        };
        Ok(results
            .hits
            .into_iter()
            .map(|hit| codec::item_from_hit(hit, tenant, item_type, placement))
            .collect())
    }

    /// Number of items matching a condition.
    ///
    /// A builder that implements native counting is used directly; otherwise
    /// the condition compiles to a filter and the backend counts hits.
    pub async fn count(
        &self,
        tenant: &TenantId,
        item_type: &str,
        condition: &Condition,
    ) -> Result<u64> {
        let result = self.count_inner(tenant, item_type, condition).await;
        Ok(self.policy.handle("count", result)?.unwrap_or(0))
    }

    async fn count_inner(
        &self,
        tenant: &TenantId,
        item_type: &str,
        condition: &Condition,
    ) -> Result<u64> {
        match self.dispatcher.count(condition, &mut Context::new()) {
            Ok(count) => return Ok(count),
            Err(GriddleError::CountUnsupported(_)) => {}
            Err(err) => return Err(err),
        }
        let filter = self
            .dispatcher
            .build_filter(condition, &mut Context::new())?;
        let scoped = wrap_with_tenant_and_item_type(
            filter,
            tenant,
            self.router.item_type_constraint(item_type),
        );
        let count = self
            .swallow_missing_index(
                self.backend
                    .count(&self.router.read_index(item_type), &scoped)
                    .await,
            )?
            .unwrap_or(0);
        Ok(count)
    }

    /// Deletes every item of one type matching a condition, waiting for the
    /// backend task to finish. Returns whether the deletion completed within
    /// the task timeout; on timeout the task keeps running server-side.
    pub async fn delete_by_condition(
        &self,
        tenant: &TenantId,
        item_type: &str,
        condition: &Condition,
    ) -> Result<bool> {
        let result = self
            .delete_by_condition_inner(tenant, item_type, condition)
            .await;
        Ok(self.policy.handle("delete_by_condition", result)?.unwrap_or(false))
    }

    async fn delete_by_condition_inner(
        &self,
        tenant: &TenantId,
        item_type: &str,
        condition: &Condition,
    ) -> Result<bool> {
        let filter = self
            .dispatcher
            .build_filter(condition, &mut Context::new())?;
        let scoped = wrap_with_tenant_and_item_type(
            filter,
            tenant,
            self.router.item_type_constraint(item_type),
        );
        let task_id = match self.swallow_missing_index(
            self.backend
                .delete_by_query(&self.router.read_index(item_type), &scoped)
                .await,
        )? {
            Some(task_id) => task_id,
            None => return Ok(true),
        };
        self.await_task(&task_id).await
    }

    /// Applies a stored script to every item of one type matching a
    /// condition. Returns whether the update completed within the task
    /// timeout.
    pub async fn update_by_condition(
        &self,
        tenant: &TenantId,
        item_type: &str,
        condition: &Condition,
        script: &str,
        params: &Value,
    ) -> Result<bool> {
        let result = self
            .update_by_condition_inner(tenant, item_type, condition, script, params)
            .await;
        Ok(self.policy.handle("update_by_condition", result)?.unwrap_or(false))
    }

    async fn update_by_condition_inner(
        &self,
        tenant: &TenantId,
        item_type: &str,
        condition: &Condition,
        script: &str,
        params: &Value,
    ) -> Result<bool> {
        let filter = self
            .dispatcher
            .build_filter(condition, &mut Context::new())?;
        let scoped = wrap_with_tenant_and_item_type(
            filter,
            tenant,
            self.router.item_type_constraint(item_type),
        );
        let task_id = self
            .backend
            .update_by_query(&self.router.read_index(item_type), &scoped, script, params)
            .await?;
        self.await_task(&task_id).await
    }

    /// Ships everything queued in the bulk ingester.
    pub async fn flush(&self) -> Result<()> {
        self.ingester.flush().await
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    fn refresh_for(&self, item_type: &str) -> RefreshPolicy {
        self.config
            .refresh_policies
            .get(item_type)
            .copied()
            .unwrap_or_default()
    }

    fn save_options(&self, item: &Item) -> WriteOptions {
        let refresh = self.refresh_for(&item.item_type);
        if self.config.always_overwrite {
            return WriteOptions {
                refresh,
                ..WriteOptions::default()
            };
        }
        if item.meta.has_concurrency_tokens() {
            WriteOptions {
                if_seq_no: item.meta.seq_no,
                if_primary_term: item.meta.primary_term,
                refresh,
                ..WriteOptions::default()
            }
        } else {
            WriteOptions {
                create_only: true,
                refresh,
                ..WriteOptions::default()
            }
        }
    }

    /// Rolling items that know their physical index are written back to it;
    /// everything else goes through the type's write name.
    fn write_target(&self, item: &Item, placement: Placement) -> String {
        if placement == Placement::Rolling {
            if let Some(index) = &item.meta.index {
                return index.clone();
            }
        }
        self.router.write_index(&item.item_type)
    }

    async fn await_task(&self, task_id: &str) -> Result<bool> {
        match tasks::wait_for_task(self.backend.as_ref(), task_id, &self.config.task).await {
            Ok(()) => Ok(true),
            Err(GriddleError::TaskTimeout { task_id, timeout_ms }) => {
                tracing::warn!(
                    task_id = %task_id,
                    timeout_ms,
                    "task still running after wait timeout, continuing without it"
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Reads against an index that does not exist yet are empty results, not
    /// errors.
    fn swallow_missing_index<T>(&self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(GriddleError::IndexNotFound(index)) => {
                tracing::debug!(index = %index, "read against missing index");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
