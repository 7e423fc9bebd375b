//! Polling loop for long-running backend tasks.
//!
//! By-query operations return a task id and complete asynchronously; callers
//! that need completion semantics poll here at a fixed interval under an
//! overall deadline.

use crate::backend::SearchBackend;
use crate::config::TaskConfig;
use crate::error::{GriddleError, Result};
use std::time::Instant;

/// Polls until the task completes. A task still running at the deadline is a
/// [`GriddleError::TaskTimeout`]; the task itself keeps running server-side.
pub async fn wait_for_task(
    backend: &dyn SearchBackend,
    task_id: &str,
    config: &TaskConfig,
) -> Result<()> {
    let started = Instant::now();
    loop {
        let status = backend.task_status(task_id).await?;
        if status.completed {
            tracing::debug!(task_id, elapsed_ms = %started.elapsed().as_millis(), "task completed");
            return Ok(());
        }
        if started.elapsed() >= config.wait_timeout {
            return Err(GriddleError::TaskTimeout {
                task_id: task_id.to_string(),
                timeout_ms: config.wait_timeout.as_millis() as u64,
            });
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}
