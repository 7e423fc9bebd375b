//! Backend filter model.
//!
//! Queries are built as a closed tree and rendered to the backend's JSON
//! query DSL at request time. Condition query builders produce these; the
//! store wraps them with tenant and item-type scoping before execution.

use serde_json::{json, Value};

/// A composable backend filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    MatchAll,
    /// Exact term match on a single field.
    Term { field: String, value: Value },
    /// Match any of the given values on a field.
    Terms { field: String, values: Vec<Value> },
    /// Inclusive/exclusive bounds; `None` leaves a side open.
    Range {
        field: String,
        gte: Option<Value>,
        gt: Option<Value>,
        lte: Option<Value>,
        lt: Option<Value>,
    },
    /// Match documents by their physical document ids.
    Ids(Vec<String>),
    /// Field existence check.
    Exists { field: String },
    Bool {
        must: Vec<Query>,
        should: Vec<Query>,
        must_not: Vec<Query>,
        filter: Vec<Query>,
        minimum_should_match: Option<u32>,
    },
}

impl Query {
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Query::Term {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(ids: I) -> Self {
        Query::Ids(ids.into_iter().map(Into::into).collect())
    }

    pub fn and(clauses: Vec<Query>) -> Self {
        Query::Bool {
            must: clauses,
            should: Vec::new(),
            must_not: Vec::new(),
            filter: Vec::new(),
            minimum_should_match: None,
        }
    }

    pub fn or(clauses: Vec<Query>) -> Self {
        Query::Bool {
            must: Vec::new(),
            should: clauses,
            must_not: Vec::new(),
            filter: Vec::new(),
            minimum_should_match: Some(1),
        }
    }

    pub fn not(clause: Query) -> Self {
        Query::Bool {
            must: vec![Query::MatchAll],
            should: Vec::new(),
            must_not: vec![clause],
            filter: Vec::new(),
            minimum_should_match: None,
        }
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, Query::MatchAll)
    }

    /// Render to the backend's JSON query DSL.
    pub fn to_json(&self) -> Value {
        match self {
            Query::MatchAll => json!({"match_all": {}}),
            Query::Term { field, value } => json!({"term": {field.clone(): value.clone()}}),
            Query::Terms { field, values } => json!({"terms": {field.clone(): values.clone()}}),
            Query::Range {
                field,
                gte,
                gt,
                lte,
                lt,
            } => {
                let mut bounds = serde_json::Map::new();
                if let Some(v) = gte {
                    bounds.insert("gte".into(), v.clone());
                }
                if let Some(v) = gt {
                    bounds.insert("gt".into(), v.clone());
                }
                if let Some(v) = lte {
                    bounds.insert("lte".into(), v.clone());
                }
                if let Some(v) = lt {
                    bounds.insert("lt".into(), v.clone());
                }
                json!({"range": {field.clone(): Value::Object(bounds)}})
            }
            Query::Ids(values) => json!({"ids": {"values": values.clone()}}),
            Query::Exists { field } => json!({"exists": {"field": field.clone()}}),
            Query::Bool {
                must,
                should,
                must_not,
                filter,
                minimum_should_match,
            } => {
                let mut body = serde_json::Map::new();
                let render = |qs: &[Query]| -> Value {
                    Value::Array(qs.iter().map(Query::to_json).collect())
                };
                if !must.is_empty() {
                    body.insert("must".into(), render(must));
                }
                if !should.is_empty() {
                    body.insert("should".into(), render(should));
                }
                if !must_not.is_empty() {
                    body.insert("must_not".into(), render(must_not));
                }
                if !filter.is_empty() {
                    body.insert("filter".into(), render(filter));
                }
                if let Some(msm) = minimum_should_match {
                    body.insert("minimum_should_match".into(), json!(msm));
                }
                json!({"bool": Value::Object(body)})
            }
        }
    }

    /// Full search request body: a match-all query filtered by `self`.
    pub fn to_request_body(&self) -> Value {
        json!({"query": {"bool": {"must": [{"match_all": {}}], "filter": [self.to_json()]}}})
    }
}

/// Scope `original` to a tenant, and to an item type when the type shares
/// its physical index with others.
pub fn wrap_with_tenant_and_item_type(
    original: Query,
    tenant_id: &crate::types::TenantId,
    item_type: Option<&str>,
) -> Query {
    let mut must = vec![Query::term("tenantId", tenant_id.as_str())];
    if let Some(item_type) = item_type {
        must.push(Query::term("itemType", item_type));
    }
    if !original.is_match_all() {
        must.push(original);
    }
    Query::and(must)
}
