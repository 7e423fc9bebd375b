//! Contextual parameter substitution.
//!
//! Parameter values of the form `parameter::<name>` are replaced by the
//! matching context entry; `script::<body>` values are evaluated through an
//! injectable [`ScriptExecutor`]. Substitution happens just before a
//! condition is handed to its query builder, so templated parent conditions
//! see the child's concrete values.

use super::{Condition, Context, ParamValue};
use std::collections::HashMap;

const PARAMETER_PREFIX: &str = "parameter::";
const SCRIPT_PREFIX: &str = "script::";

/// Evaluates `script::` parameter values against the current context.
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, script: &str, context: &Context) -> Option<ParamValue>;
}

/// A script executor that refuses every script. Deployments without a
/// scripting engine resolve `script::` parameters to nothing, which makes
/// the enclosing condition unresolvable and fail-open at dispatch.
pub struct NoopScriptExecutor;

impl ScriptExecutor for NoopScriptExecutor {
    fn execute(&self, script: &str, _context: &Context) -> Option<ParamValue> {
        tracing::warn!("No script executor configured, cannot evaluate script: {}", script);
        None
    }
}

/// Returns the condition with contextual parameters substituted, the
/// condition unchanged when it has none, or `None` when a substitution
/// yields nothing usable.
pub fn contextual_condition(
    condition: &Condition,
    context: &Context,
    script_executor: &dyn ScriptExecutor,
) -> Option<Condition> {
    if !has_contextual_parameter(&condition.parameter_values) {
        return Some(condition.clone());
    }
    let mut values = HashMap::new();
    for (name, value) in &condition.parameter_values {
        let resolved = resolve_value(value, context, script_executor)?;
        values.insert(name.clone(), resolved);
    }
    Some(Condition {
        condition_type_id: condition.condition_type_id.clone(),
        condition_type: condition.condition_type.clone(),
        parameter_values: values,
    })
}

fn resolve_value(
    value: &ParamValue,
    context: &Context,
    script_executor: &dyn ScriptExecutor,
) -> Option<ParamValue> {
    match value {
        ParamValue::Text(s) => {
            if let Some(name) = s.strip_prefix(PARAMETER_PREFIX) {
                context.get(name).cloned()
            } else if let Some(script) = s.strip_prefix(SCRIPT_PREFIX) {
                script_executor.execute(script, context)
            } else {
                Some(value.clone())
            }
        }
        ParamValue::Map(entries) => {
            // A single unresolvable entry invalidates the whole map.
            let mut resolved = HashMap::new();
            for (name, entry) in entries {
                resolved.insert(name.clone(), resolve_value(entry, context, script_executor)?);
            }
            Some(ParamValue::Map(resolved))
        }
        ParamValue::List(items) => {
            // Unresolvable list elements are dropped, not fatal.
            let resolved = items
                .iter()
                .filter_map(|item| resolve_value(item, context, script_executor))
                .collect();
            Some(ParamValue::List(resolved))
        }
        other => Some(other.clone()),
    }
}

fn has_contextual_parameter(values: &HashMap<String, ParamValue>) -> bool {
    values.values().any(value_is_contextual)
}

fn value_is_contextual(value: &ParamValue) -> bool {
    match value {
        ParamValue::Text(s) => s.starts_with(PARAMETER_PREFIX) || s.starts_with(SCRIPT_PREFIX),
        ParamValue::Map(entries) => entries.values().any(value_is_contextual),
        ParamValue::List(items) => items.iter().any(value_is_contextual),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionType;

    struct UppercaseExecutor;

    impl ScriptExecutor for UppercaseExecutor {
        fn execute(&self, script: &str, _context: &Context) -> Option<ParamValue> {
            Some(ParamValue::Text(script.to_uppercase()))
        }
    }

    fn condition_with(name: &str, value: ParamValue) -> Condition {
        Condition::new(ConditionType::with_builder("test", "testBuilder"))
            .with_parameter(name, value)
    }

    #[test]
    fn plain_condition_passes_through() {
        let condition = condition_with("propertyName", "age".into());
        let resolved = contextual_condition(&condition, &Context::new(), &NoopScriptExecutor);
        assert_eq!(resolved.as_ref(), Some(&condition));
    }

    #[test]
    fn parameter_reference_is_substituted_from_context() {
        let condition = condition_with("propertyValue", "parameter::threshold".into());
        let mut context = Context::new();
        context.insert("threshold".into(), ParamValue::Integer(42));

        let resolved =
            contextual_condition(&condition, &context, &NoopScriptExecutor).expect("resolvable");
        assert_eq!(
            resolved.parameter("propertyValue"),
            Some(&ParamValue::Integer(42))
        );
    }

    #[test]
    fn missing_parameter_reference_invalidates_the_condition() {
        let condition = condition_with("propertyValue", "parameter::absent".into());
        assert!(contextual_condition(&condition, &Context::new(), &NoopScriptExecutor).is_none());
    }

    #[test]
    fn script_values_run_through_the_executor() {
        let condition = condition_with("propertyValue", "script::now".into());
        let resolved =
            contextual_condition(&condition, &Context::new(), &UppercaseExecutor).unwrap();
        assert_eq!(
            resolved.parameter("propertyValue"),
            Some(&ParamValue::Text("NOW".into()))
        );

        assert!(contextual_condition(&condition, &Context::new(), &NoopScriptExecutor).is_none());
    }

    #[test]
    fn unresolvable_list_entries_are_dropped() {
        let condition = condition_with(
            "values",
            ParamValue::List(vec!["parameter::present".into(), "parameter::absent".into()]),
        );
        let mut context = Context::new();
        context.insert("present".into(), ParamValue::Text("kept".into()));

        let resolved = contextual_condition(&condition, &context, &NoopScriptExecutor).unwrap();
        assert_eq!(
            resolved.parameter("values"),
            Some(&ParamValue::List(vec![ParamValue::Text("kept".into())]))
        );
    }
}
