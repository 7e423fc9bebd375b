//! Backend-independent condition model.
//!
//! A [`Condition`] is a typed, parameterized, possibly nested predicate.
//! Parameter values form a tagged tree ([`ParamValue`]) so nested conditions
//! and collections are walked structurally, never reflectively. Condition
//! types either name a query builder directly or delegate to a parent
//! condition template, which is how the platform expresses condition
//! inheritance.

pub mod availability;
pub mod context;
pub mod dispatcher;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Accumulating key/value map threaded through condition delegation and
/// contextual parameter substitution.
pub type Context = HashMap<String, ParamValue>;

/// A condition parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Condition(Box<Condition>),
    List(Vec<ParamValue>),
    Map(HashMap<String, ParamValue>),
}

impl ParamValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_condition(&self) -> Option<&Condition> {
        match self {
            ParamValue::Condition(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Integer(i)
    }
}

impl From<Condition> for ParamValue {
    fn from(c: Condition) -> Self {
        ParamValue::Condition(Box::new(c))
    }
}

/// A typed condition node.
///
/// The resolved type reference is optional on the wire but mandatory before
/// dispatch: the dispatcher treats an unresolved type as a programming error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type_id: String,
    #[serde(skip)]
    pub condition_type: Option<Arc<ConditionType>>,
    #[serde(default)]
    pub parameter_values: HashMap<String, ParamValue>,
}

impl Condition {
    pub fn new(condition_type: Arc<ConditionType>) -> Self {
        Condition {
            condition_type_id: condition_type.id.clone(),
            condition_type: Some(condition_type),
            parameter_values: HashMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameter_values.insert(name.into(), value.into());
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParamValue> {
        self.parameter_values.get(name)
    }
}

/// A condition type definition.
///
/// Either names a query builder, or carries a parent condition template that
/// the dispatcher recurses on. A delegation chain must terminate at a
/// builder-bearing type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionType {
    pub id: String,
    #[serde(default)]
    pub query_builder: Option<String>,
    #[serde(default)]
    pub parent_condition: Option<Condition>,
}

impl ConditionType {
    pub fn with_builder(id: impl Into<String>, query_builder: impl Into<String>) -> Arc<Self> {
        Arc::new(ConditionType {
            id: id.into(),
            query_builder: Some(query_builder.into()),
            parent_condition: None,
        })
    }

    pub fn with_parent(id: impl Into<String>, parent_condition: Condition) -> Arc<Self> {
        Arc::new(ConditionType {
            id: id.into(),
            query_builder: None,
            parent_condition: Some(parent_condition),
        })
    }
}
