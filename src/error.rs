use thiserror::Error;

#[derive(Error, Debug)]
pub enum GriddleError {
    #[error("Condition type not resolved for condition: {0}")]
    ConditionNotResolved(String),

    #[error("Condition type {0} has no query builder and no parent condition")]
    MissingBuilderDefinition(String),

    #[error("Counting is not supported for condition type: {0}")]
    CountUnsupported(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Version conflict for document {0}")]
    VersionConflict(String),

    #[error("Ingest queue full ({0} operations pending)")]
    QueueFull(usize),

    #[error("Ingest queue closed")]
    QueueClosed,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Timed out waiting for task {task_id} after {timeout_ms}ms")]
    TaskTimeout { task_id: String, timeout_ms: u64 },

    #[error("Index bring-up failed for {index}: {reason}")]
    BringUp { index: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, GriddleError>;

impl From<serde_json::Error> for GriddleError {
    fn from(e: serde_json::Error) -> Self {
        GriddleError::Json(e.to_string())
    }
}

/// True when the error, or anything in its source chain, contains one of the
/// operator-configured fatal substrings. A match means the backend is in a
/// state the deployment has classified as unrecoverable.
pub fn matches_fatal(err: &(dyn std::error::Error + 'static), patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let msg = e.to_string();
        if patterns.iter().any(|p| !p.is_empty() && msg.contains(p)) {
            return true;
        }
        current = e.source();
    }
    false
}

/// Decides what happens to non-fatal internal errors: production deployments
/// swallow and log to stay available under partial backend degradation,
/// development setups rethrow. Fatal matches always trigger the shutdown hook.
#[derive(Default)]
pub struct ErrorPolicy {
    throw_exceptions: bool,
    fatal_patterns: Vec<String>,
    shutdown_hook: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ErrorPolicy {
    pub fn new(throw_exceptions: bool, fatal_patterns: Vec<String>) -> Self {
        ErrorPolicy {
            throw_exceptions,
            fatal_patterns,
            shutdown_hook: None,
        }
    }

    /// Installs the hook invoked on a fatal-classified error. The default
    /// hook exits the process; embedders and tests can substitute an orderly
    /// shutdown of their own.
    pub fn with_shutdown_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.shutdown_hook = Some(Box::new(hook));
        self
    }

    pub fn is_fatal(&self, err: &GriddleError) -> bool {
        matches_fatal(err, &self.fatal_patterns)
    }

    /// Applies the policy to an operation result. Fatal errors stop the
    /// process via the shutdown hook; non-fatal errors are either swallowed
    /// (returning `None`) or propagated, depending on configuration.
    pub fn handle<T>(&self, context: &str, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                if self.is_fatal(&err) {
                    tracing::error!(
                        "Fatal state error in {}: {} - stopping application",
                        context,
                        err
                    );
                    match &self.shutdown_hook {
                        Some(hook) => hook(),
                        None => std::process::exit(-1),
                    }
                    return Ok(None);
                }
                if self.throw_exceptions {
                    return Err(err);
                }
                tracing::error!("Error in {}: {}", context, err);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Error)]
    #[error("outer wrapper")]
    struct Outer {
        #[source]
        inner: Inner,
    }

    #[derive(Debug, Error)]
    #[error("node left the cluster unexpectedly")]
    struct Inner;

    #[test]
    fn fatal_matching_walks_the_source_chain() {
        let err = Outer { inner: Inner };
        assert!(matches_fatal(&err, &["left the cluster".to_string()]));
        assert!(!matches_fatal(&err, &["disk full".to_string()]));
        assert!(!matches_fatal(&err, &[]));
    }

    #[test]
    fn swallow_mode_logs_and_returns_none() {
        let policy = ErrorPolicy::new(false, vec![]);
        let result: Result<Option<u32>> =
            policy.handle("test", Err(GriddleError::Backend("boom".into())));
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn rethrow_mode_propagates() {
        let policy = ErrorPolicy::new(true, vec![]);
        let result: Result<Option<u32>> =
            policy.handle("test", Err(GriddleError::Backend("boom".into())));
        assert!(result.is_err());
    }

    #[test]
    fn fatal_error_invokes_shutdown_hook() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        let policy = ErrorPolicy::new(false, vec!["corrupted translog".to_string()])
            .with_shutdown_hook(move || fired_clone.store(true, Ordering::SeqCst));
        let result: Result<Option<u32>> = policy.handle(
            "test",
            Err(GriddleError::Backend(
                "shard has corrupted translog data".into(),
            )),
        );
        assert!(matches!(result, Ok(None)));
        assert!(fired.load(Ordering::SeqCst));
    }
}
