//! Condition-to-query dispatch.
//!
//! The dispatcher owns an id-keyed registry of [`ConditionQueryBuilder`]
//! implementations and routes each condition to the builder its type names,
//! walking parent-condition delegation chains and applying contextual
//! substitution on the way. A missing builder degrades to a permissive
//! match-all filter rather than failing the request: availability over
//! strict correctness.

use super::context::{contextual_condition, ScriptExecutor};
use super::{Condition, Context};
use crate::error::{GriddleError, Result};
use crate::query::Query;
use dashmap::DashMap;
use std::sync::Arc;

/// Maximum parent-delegation depth; a longer chain is treated as a
/// definition error rather than followed indefinitely.
const MAX_DELEGATION_DEPTH: usize = 10;

/// Pluggable translator from one concrete condition type to a backend
/// filter, registered by id. Counting is optional; the default signals
/// "unsupported" so callers fall back to counting filtered hits.
pub trait ConditionQueryBuilder: Send + Sync {
    fn build_query(
        &self,
        condition: &Condition,
        context: &mut Context,
        dispatcher: &QueryBuilderDispatcher,
    ) -> Result<Query>;

    fn count(
        &self,
        condition: &Condition,
        _context: &mut Context,
        _dispatcher: &QueryBuilderDispatcher,
    ) -> Result<u64> {
        Err(GriddleError::CountUnsupported(
            condition.condition_type_id.clone(),
        ))
    }
}

pub struct QueryBuilderDispatcher {
    builders: DashMap<String, Arc<dyn ConditionQueryBuilder>>,
    script_executor: Arc<dyn ScriptExecutor>,
}

impl QueryBuilderDispatcher {
    pub fn new(script_executor: Arc<dyn ScriptExecutor>) -> Self {
        QueryBuilderDispatcher {
            builders: DashMap::new(),
            script_executor,
        }
    }

    /// Registers a query builder under the provided id, replacing any
    /// previous registration.
    pub fn register(&self, id: impl Into<String>, builder: Arc<dyn ConditionQueryBuilder>) {
        self.builders.insert(id.into(), builder);
    }

    pub fn deregister(&self, id: &str) {
        self.builders.remove(id);
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.builders.contains_key(id)
    }

    /// Full query body: match-all filtered by the condition's filter.
    pub fn get_query(&self, condition: &Condition) -> Result<Query> {
        let filter = self.build_filter(condition, &mut Context::new())?;
        Ok(Query::Bool {
            must: vec![Query::MatchAll],
            should: Vec::new(),
            must_not: Vec::new(),
            filter: vec![filter],
            minimum_should_match: None,
        })
    }

    /// Compiles a condition into a backend filter.
    ///
    /// Parent delegation merges each level's own parameters into `context`
    /// before recursing; an unregistered builder id fails open to
    /// [`Query::MatchAll`].
    pub fn build_filter(&self, condition: &Condition, context: &mut Context) -> Result<Query> {
        let (effective, builder_key) = self.resolve_effective(condition, context)?;

        let builder = match self.builders.get(&builder_key) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                tracing::warn!(
                    "No query builder registered for id {} (condition type {}), returning match-all",
                    builder_key,
                    effective.condition_type_id
                );
                return Ok(Query::MatchAll);
            }
        };

        match contextual_condition(&effective, context, self.script_executor.as_ref()) {
            Some(contextual) => builder.build_query(&contextual, context, self),
            None => {
                tracing::warn!(
                    "Contextual resolution produced no usable condition for type {}, returning match-all",
                    effective.condition_type_id
                );
                Ok(Query::MatchAll)
            }
        }
    }

    /// Counts matches for a condition through its builder.
    ///
    /// Unlike [`QueryBuilderDispatcher::build_filter`] this does not fail
    /// open: a missing or count-less builder is reported as unsupported so
    /// the caller can count filtered hits instead.
    pub fn count(&self, condition: &Condition, context: &mut Context) -> Result<u64> {
        let (effective, builder_key) = self.resolve_effective(condition, context)?;

        let builder = match self.builders.get(&builder_key) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                return Err(GriddleError::CountUnsupported(
                    effective.condition_type_id.clone(),
                ))
            }
        };

        match contextual_condition(&effective, context, self.script_executor.as_ref()) {
            Some(contextual) => builder.count(&contextual, context, self),
            None => Err(GriddleError::CountUnsupported(
                effective.condition_type_id.clone(),
            )),
        }
    }

    /// Follows the parent-condition chain until a builder-bearing type is
    /// found, merging each condition's parameters into the context.
    fn resolve_effective(
        &self,
        condition: &Condition,
        context: &mut Context,
    ) -> Result<(Condition, String)> {
        let mut current = condition.clone();
        for _ in 0..MAX_DELEGATION_DEPTH {
            let condition_type = current.condition_type.clone().ok_or_else(|| {
                GriddleError::ConditionNotResolved(current.condition_type_id.clone())
            })?;

            if let Some(builder_key) = &condition_type.query_builder {
                return Ok((current.clone(), builder_key.clone()));
            }

            let parent = condition_type.parent_condition.clone().ok_or_else(|| {
                GriddleError::MissingBuilderDefinition(condition_type.id.clone())
            })?;

            // The child's parameters take precedence over anything an outer
            // level already contributed.
            context.extend(current.parameter_values.clone());
            current = parent;
        }
        Err(GriddleError::MissingBuilderDefinition(format!(
            "{} (delegation deeper than {} levels)",
            condition.condition_type_id, MAX_DELEGATION_DEPTH
        )))
    }
}
