//! In-process [`SearchBackend`] used for embedding and tests.
//!
//! Evaluates the filter tree directly against stored JSON documents instead
//! of rendering it to the wire DSL. Write semantics mirror the external
//! service closely enough for the store layer to be exercised unchanged:
//! per-document sequence numbers, conditional writes, aliases with a write
//! index, index templates matched by pattern, and by-query operations that
//! complete through the task-polling path.

use super::{
    AliasSpec, AliasTarget, BulkOp, GetResult, SearchBackend, SearchHit, SearchResults, TaskInfo,
    WriteOptions, WriteResponse,
};
use crate::error::{GriddleError, Result};
use crate::query::Query;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};

#[derive(Debug, Clone)]
struct StoredDoc {
    source: Value,
    seq_no: u64,
    primary_term: u64,
}

struct IndexState {
    settings: Value,
    docs: HashMap<String, StoredDoc>,
    next_seq_no: u64,
}

pub struct InMemoryBackend {
    indices: DashMap<String, Mutex<IndexState>>,
    aliases: DashMap<String, Vec<AliasTarget>>,
    templates: DashMap<String, Value>,
    policies: DashMap<String, Value>,
    tasks: DashMap<String, AtomicU32>,
    next_task: AtomicU64,
    /// Number of status polls a new task reports as still running. Zero by
    /// default; tests raise it to exercise the polling loop.
    task_poll_delay: AtomicU32,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend {
            indices: DashMap::new(),
            aliases: DashMap::new(),
            templates: DashMap::new(),
            policies: DashMap::new(),
            tasks: DashMap::new(),
            next_task: AtomicU64::new(1),
            task_poll_delay: AtomicU32::new(0),
        }
    }

    pub fn set_task_poll_delay(&self, polls: u32) {
        self.task_poll_delay.store(polls, AtomicOrdering::SeqCst);
    }

    pub fn doc_count(&self, index: &str) -> usize {
        self.indices
            .get(index)
            .map(|state| state.lock().docs.len())
            .unwrap_or(0)
    }

    fn spawn_task(&self) -> String {
        let task_id = format!("task:{}", self.next_task.fetch_add(1, AtomicOrdering::SeqCst));
        let delay = self.task_poll_delay.load(AtomicOrdering::SeqCst);
        self.tasks.insert(task_id.clone(), AtomicU32::new(delay));
        task_id
    }

    /// Write target behind a name: the alias write index, or the name itself.
    fn write_index(&self, name: &str) -> Result<String> {
        if let Some(targets) = self.aliases.get(name) {
            return targets
                .iter()
                .find(|t| t.is_write_index)
                .map(|t| t.index.clone())
                .ok_or_else(|| {
                    GriddleError::Backend(format!("alias {} has no write index", name))
                });
        }
        Ok(name.to_string())
    }

    /// Concrete indices a read against `pattern` fans out to. Wildcards and
    /// aliases expand, possibly to nothing; a missing concrete name is an
    /// index-not-found error.
    fn read_indices(&self, pattern: &str) -> Result<Vec<String>> {
        if pattern.contains('*') {
            let mut names: Vec<String> = self
                .indices
                .iter()
                .map(|entry| entry.key().clone())
                .filter(|name| wildcard_match(pattern, name))
                .collect();
            names.sort();
            return Ok(names);
        }
        if let Some(targets) = self.aliases.get(pattern) {
            return Ok(targets.iter().map(|t| t.index.clone()).collect());
        }
        if self.indices.contains_key(pattern) {
            return Ok(vec![pattern.to_string()]);
        }
        Err(GriddleError::IndexNotFound(pattern.to_string()))
    }

    fn ensure_index(&self, name: &str) {
        self.indices
            .entry(name.to_string())
            .or_insert_with(|| {
                Mutex::new(IndexState {
                    settings: self.template_settings_for(name),
                    docs: HashMap::new(),
                    next_seq_no: 0,
                })
            });
    }

    fn template_settings_for(&self, index: &str) -> Value {
        for entry in self.templates.iter() {
            let patterns = entry.value().get("index_patterns").and_then(Value::as_array);
            let matched = patterns
                .map(|ps| {
                    ps.iter()
                        .filter_map(Value::as_str)
                        .any(|p| wildcard_match(p, index))
                })
                .unwrap_or(false);
            if matched {
                return entry
                    .value()
                    .get("template")
                    .cloned()
                    .unwrap_or_else(|| entry.value().clone());
            }
        }
        Value::Object(serde_json::Map::new())
    }

    fn apply_write(
        &self,
        index: &str,
        id: &str,
        document: &Value,
        options: &WriteOptions,
        partial: bool,
    ) -> Result<WriteResponse> {
        let physical = self.write_index(index)?;
        self.ensure_index(&physical);
        let state = self
            .indices
            .get(&physical)
            .ok_or_else(|| GriddleError::IndexNotFound(physical.clone()))?;
        let mut state = state.lock();

        let existing = state.docs.get(id).cloned();
        if options.create_only && existing.is_some() {
            return Err(GriddleError::VersionConflict(id.to_string()));
        }
        if let (Some(if_seq_no), Some(if_primary_term)) =
            (options.if_seq_no, options.if_primary_term)
        {
            match &existing {
                Some(doc) if doc.seq_no == if_seq_no && doc.primary_term == if_primary_term => {}
                _ => return Err(GriddleError::VersionConflict(id.to_string())),
            }
        }
        if partial && existing.is_none() {
            return Err(GriddleError::Backend(format!(
                "document missing: {}/{}",
                physical, id
            )));
        }

        let source = match (&existing, partial) {
            (Some(doc), true) => merge_documents(&doc.source, document),
            _ => document.clone(),
        };
        let seq_no = state.next_seq_no;
        state.next_seq_no += 1;
        let created = existing.is_none();
        state.docs.insert(
            id.to_string(),
            StoredDoc {
                source,
                seq_no,
                primary_term: 1,
            },
        );
        Ok(WriteResponse {
            id: id.to_string(),
            index: physical,
            seq_no,
            primary_term: 1,
            created,
        })
    }
}

#[async_trait]
impl SearchBackend for InMemoryBackend {
    async fn get(&self, index: &str, id: &str) -> Result<Option<GetResult>> {
        for physical in self.read_indices(index)? {
            if let Some(state) = self.indices.get(&physical) {
                if let Some(doc) = state.lock().docs.get(id) {
                    return Ok(Some(GetResult {
                        id: id.to_string(),
                        index: physical,
                        seq_no: doc.seq_no,
                        primary_term: doc.primary_term,
                        source: doc.source.clone(),
                    }));
                }
            }
        }
        Ok(None)
    }

    async fn index(
        &self,
        index: &str,
        id: &str,
        document: &Value,
        options: &WriteOptions,
    ) -> Result<WriteResponse> {
        self.apply_write(index, id, document, options, false)
    }

    async fn update(
        &self,
        index: &str,
        id: &str,
        doc: &Value,
        options: &WriteOptions,
    ) -> Result<WriteResponse> {
        self.apply_write(index, id, doc, options, true)
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool> {
        for physical in self.read_indices(index)? {
            if let Some(state) = self.indices.get(&physical) {
                if state.lock().docs.remove(id).is_some() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn bulk(&self, ops: Vec<BulkOp>) -> Result<()> {
        let mut failures = Vec::new();
        for op in ops {
            let outcome = match &op {
                BulkOp::Index {
                    index,
                    id,
                    document,
                    options,
                } => self.apply_write(index, id, document, options, false).map(|_| ()),
                BulkOp::Update {
                    index,
                    id,
                    doc,
                    options,
                } => self.apply_write(index, id, doc, options, true).map(|_| ()),
                BulkOp::Delete { index, id } => self.delete(index, id).await.map(|_| ()),
            };
            if let Err(err) = outcome {
                failures.push(err.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GriddleError::Backend(format!(
                "bulk had {} failed operations: {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    async fn search(&self, index: &str, query: &Query, size: usize) -> Result<SearchResults> {
        let mut results = SearchResults::default();
        for physical in self.read_indices(index)? {
            if let Some(state) = self.indices.get(&physical) {
                let state = state.lock();
                let mut ids: Vec<&String> = state.docs.keys().collect();
                ids.sort();
                for id in ids {
                    let doc = &state.docs[id];
                    if evaluate(query, id, &doc.source) {
                        results.total += 1;
                        if results.hits.len() < size {
                            results.hits.push(SearchHit {
                                id: id.clone(),
                                index: physical.clone(),
                                seq_no: doc.seq_no,
                                primary_term: doc.primary_term,
                                source: doc.source.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(results)
    }

    async fn count(&self, index: &str, query: &Query) -> Result<u64> {
        let mut total = 0;
        for physical in self.read_indices(index)? {
            if let Some(state) = self.indices.get(&physical) {
                let state = state.lock();
                total += state
                    .docs
                    .iter()
                    .filter(|(id, doc)| evaluate(query, id, &doc.source))
                    .count() as u64;
            }
        }
        Ok(total)
    }

    async fn delete_by_query(&self, index: &str, query: &Query) -> Result<String> {
        for physical in self.read_indices(index)? {
            if let Some(state) = self.indices.get(&physical) {
                let mut state = state.lock();
                state
                    .docs
                    .retain(|id, doc| !evaluate(query, id, &doc.source));
            }
        }
        Ok(self.spawn_task())
    }

    async fn update_by_query(
        &self,
        index: &str,
        query: &Query,
        script: &str,
        params: &Value,
    ) -> Result<String> {
        // No script engine in process. Object params are merged into every
        // matching document, which covers the property-update scripts the
        // store issues; anything else leaves documents untouched.
        if let Some(updates) = params.as_object() {
            for physical in self.read_indices(index)? {
                if let Some(state) = self.indices.get(&physical) {
                    let mut state = state.lock();
                    let matching: Vec<String> = state
                        .docs
                        .iter()
                        .filter(|(id, doc)| evaluate(query, id, &doc.source))
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in matching {
                        let seq_no = state.next_seq_no;
                        state.next_seq_no += 1;
                        if let Some(doc) = state.docs.get_mut(&id) {
                            doc.source =
                                merge_documents(&doc.source, &Value::Object(updates.clone()));
                            doc.seq_no = seq_no;
                        }
                    }
                }
            }
        } else {
            tracing::debug!(script, "update_by_query script not evaluated in memory");
        }
        Ok(self.spawn_task())
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskInfo> {
        let remaining = self
            .tasks
            .get(task_id)
            .ok_or_else(|| GriddleError::TaskNotFound(task_id.to_string()))?;
        let completed = if remaining.load(AtomicOrdering::SeqCst) == 0 {
            true
        } else {
            remaining.fetch_sub(1, AtomicOrdering::SeqCst);
            false
        };
        Ok(TaskInfo {
            task_id: task_id.to_string(),
            completed,
        })
    }

    async fn create_index(
        &self,
        name: &str,
        settings: &Value,
        aliases: &[AliasSpec],
    ) -> Result<()> {
        let merged = merge_documents(&self.template_settings_for(name), settings);
        self.indices.insert(
            name.to_string(),
            Mutex::new(IndexState {
                settings: merged,
                docs: HashMap::new(),
                next_seq_no: 0,
            }),
        );
        for spec in aliases {
            let mut targets = self.aliases.entry(spec.alias.clone()).or_default();
            targets.retain(|t| t.index != name);
            if spec.is_write_index {
                // a new write index demotes the previous one
                for target in targets.iter_mut() {
                    target.is_write_index = false;
                }
            }
            targets.push(AliasTarget {
                index: name.to_string(),
                is_write_index: spec.is_write_index,
            });
        }
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<bool> {
        let removed = self.indices.remove(name).is_some();
        for mut targets in self.aliases.iter_mut() {
            targets.retain(|t| t.index != name);
        }
        Ok(removed)
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        Ok(self.indices.contains_key(name) || self.aliases.contains_key(name))
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Vec<AliasTarget>> {
        Ok(self
            .aliases
            .get(alias)
            .map(|targets| targets.clone())
            .unwrap_or_default())
    }

    async fn put_index_template(&self, name: &str, body: &Value) -> Result<()> {
        self.templates.insert(name.to_string(), body.clone());
        Ok(())
    }

    async fn index_template_exists(&self, name: &str) -> Result<bool> {
        Ok(self.templates.contains_key(name))
    }

    async fn get_index_settings(&self, index: &str) -> Result<Value> {
        self.indices
            .get(index)
            .map(|state| state.lock().settings.clone())
            .ok_or_else(|| GriddleError::IndexNotFound(index.to_string()))
    }

    async fn put_lifecycle_policy(&self, name: &str, body: &Value) -> Result<bool> {
        self.policies.insert(name.to_string(), body.clone());
        Ok(true)
    }

    async fn lifecycle_policy_exists(&self, name: &str) -> Result<bool> {
        Ok(self.policies.contains_key(name))
    }
}

/// `*` matches any run of characters; everything else is literal.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    fn matches(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&p[1..], n) || (!n.is_empty() && matches(p, &n[1..]))
            }
            (Some(pc), Some(nc)) if pc == nc => matches(&p[1..], &n[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

/// Recursive object merge, the backend's partial-update semantics: nested
/// objects merge key by key, everything else is replaced.
fn merge_documents(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            for (key, value) in patch {
                let entry = match merged.get(key) {
                    Some(existing) => merge_documents(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

fn evaluate(query: &Query, doc_id: &str, source: &Value) -> bool {
    match query {
        Query::MatchAll => true,
        Query::Term { field, value } => field_matches(source, field, value),
        Query::Terms { field, values } => {
            values.iter().any(|value| field_matches(source, field, value))
        }
        Query::Ids(ids) => ids.iter().any(|id| id == doc_id),
        Query::Exists { field } => lookup(source, field).is_some(),
        Query::Range {
            field,
            gte,
            gt,
            lte,
            lt,
        } => {
            let Some(actual) = lookup(source, field) else {
                return false;
            };
            let within = |bound: &Option<Value>, ok: fn(Ordering) -> bool| {
                bound
                    .as_ref()
                    .map(|b| compare(actual, b).map(ok).unwrap_or(false))
                    .unwrap_or(true)
            };
            within(gte, Ordering::is_ge)
                && within(gt, Ordering::is_gt)
                && within(lte, Ordering::is_le)
                && within(lt, Ordering::is_lt)
        }
        Query::Bool {
            must,
            should,
            must_not,
            filter,
            minimum_should_match,
        } => {
            if !must.iter().all(|q| evaluate(q, doc_id, source)) {
                return false;
            }
            if !filter.iter().all(|q| evaluate(q, doc_id, source)) {
                return false;
            }
            if must_not.iter().any(|q| evaluate(q, doc_id, source)) {
                return false;
            }
            let required = match minimum_should_match {
                Some(n) => *n as usize,
                // should is optional when other clauses constrain the match
                None if must.is_empty() && filter.is_empty() && !should.is_empty() => 1,
                None => 0,
            };
            if required > 0 {
                let satisfied = should
                    .iter()
                    .filter(|q| evaluate(q, doc_id, source))
                    .count();
                if satisfied < required {
                    return false;
                }
            }
            true
        }
    }
}

fn field_matches(source: &Value, field: &str, expected: &Value) -> bool {
    match lookup(source, field) {
        Some(Value::Array(items)) => items.iter().any(|item| item == expected),
        Some(actual) => actual == expected,
        None => false,
    }
}

fn lookup<'a>(source: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = source;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> InMemoryBackend {
        InMemoryBackend::new()
    }

    #[tokio::test]
    async fn conditional_write_detects_concurrent_modification() {
        let backend = backend();
        let first = backend
            .index("items", "a", &json!({"v": 1}), &WriteOptions::default())
            .await
            .unwrap();

        // A second unconditional write bumps the sequence number.
        backend
            .index("items", "a", &json!({"v": 2}), &WriteOptions::default())
            .await
            .unwrap();

        let stale = WriteOptions {
            if_seq_no: Some(first.seq_no),
            if_primary_term: Some(first.primary_term),
            ..WriteOptions::default()
        };
        let err = backend
            .index("items", "a", &json!({"v": 3}), &stale)
            .await
            .unwrap_err();
        assert!(matches!(err, GriddleError::VersionConflict(_)));
    }

    #[tokio::test]
    async fn create_only_fails_on_existing_document() {
        let backend = backend();
        let create_only = WriteOptions {
            create_only: true,
            ..WriteOptions::default()
        };
        backend
            .index("items", "a", &json!({}), &create_only)
            .await
            .unwrap();
        assert!(backend
            .index("items", "a", &json!({}), &create_only)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn partial_update_merges_nested_objects() {
        let backend = backend();
        backend
            .index(
                "items",
                "a",
                &json!({"properties": {"city": "Paris", "age": 30}, "v": 1}),
                &WriteOptions::default(),
            )
            .await
            .unwrap();
        backend
            .update(
                "items",
                "a",
                &json!({"properties": {"age": 31}}),
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        let doc = backend.get("items", "a").await.unwrap().unwrap();
        assert_eq!(doc.source["properties"]["city"], json!("Paris"));
        assert_eq!(doc.source["properties"]["age"], json!(31));
        assert_eq!(doc.source["v"], json!(1));
    }

    #[tokio::test]
    async fn search_on_missing_concrete_index_is_an_error_but_wildcard_is_empty() {
        let backend = backend();
        let err = backend.search("nope", &Query::MatchAll, 10).await.unwrap_err();
        assert!(matches!(err, GriddleError::IndexNotFound(_)));

        let results = backend.search("nope-*", &Query::MatchAll, 10).await.unwrap();
        assert_eq!(results.total, 0);
    }

    #[tokio::test]
    async fn alias_routes_writes_to_the_write_index_and_reads_to_all() {
        let backend = backend();
        backend
            .create_index(
                "logs-000001",
                &json!({}),
                &[AliasSpec {
                    alias: "logs".into(),
                    is_write_index: false,
                }],
            )
            .await
            .unwrap();
        backend
            .create_index("logs-000002", &json!({}), &[AliasSpec::write("logs")])
            .await
            .unwrap();

        let response = backend
            .index("logs", "a", &json!({"n": 1}), &WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(response.index, "logs-000002");

        let hit = backend.get("logs", "a").await.unwrap().unwrap();
        assert_eq!(hit.index, "logs-000002");
        assert_eq!(backend.doc_count("logs-000001"), 0);
    }

    #[tokio::test]
    async fn range_and_bool_queries_filter_documents() {
        let backend = backend();
        for (id, age) in [("a", 25), ("b", 35), ("c", 45)] {
            backend
                .index(
                    "items",
                    id,
                    &json!({"properties": {"age": age}}),
                    &WriteOptions::default(),
                )
                .await
                .unwrap();
        }

        let query = Query::and(vec![
            Query::Range {
                field: "properties.age".into(),
                gte: Some(json!(30)),
                gt: None,
                lte: None,
                lt: Some(json!(40)),
            },
        ]);
        let results = backend.search("items", &query, 10).await.unwrap();
        assert_eq!(results.total, 1);
        assert_eq!(results.hits[0].id, "b");
    }

    #[tokio::test]
    async fn delete_by_query_removes_matches_and_returns_pollable_task() {
        let backend = backend();
        backend.set_task_poll_delay(2);
        for (id, kind) in [("a", "event"), ("b", "event"), ("c", "rule")] {
            backend
                .index("items", id, &json!({"itemType": kind}), &WriteOptions::default())
                .await
                .unwrap();
        }

        let task_id = backend
            .delete_by_query("items", &Query::term("itemType", "event"))
            .await
            .unwrap();
        assert_eq!(backend.doc_count("items"), 1);

        assert!(!backend.task_status(&task_id).await.unwrap().completed);
        assert!(!backend.task_status(&task_id).await.unwrap().completed);
        assert!(backend.task_status(&task_id).await.unwrap().completed);
    }

    #[tokio::test]
    async fn templates_apply_settings_to_matching_new_indices() {
        let backend = backend();
        backend
            .put_index_template(
                "ctx-event-rollover-template",
                &json!({
                    "index_patterns": ["ctx-event-*"],
                    "template": {"settings": {"number_of_shards": 3}}
                }),
            )
            .await
            .unwrap();
        backend
            .create_index("ctx-event-000001", &json!({}), &[])
            .await
            .unwrap();

        let settings = backend.get_index_settings("ctx-event-000001").await.unwrap();
        assert_eq!(settings["settings"]["number_of_shards"], json!(3));
    }
}
