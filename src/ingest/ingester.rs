//! The bulk ingester: a bounded queue drained by a background task.
//!
//! Operations accumulate until one of three thresholds trips: queued
//! operation count, estimated payload bytes, or the flush interval since the
//! last shipment. A failed shipment retries on the configured backoff
//! schedule; an exhausted schedule drops the batch with an error log rather
//! than wedging the queue.

use super::BackoffPolicy;
use crate::backend::{BulkOp, SearchBackend};
use crate::config::IngestConfig;
use crate::error::{GriddleError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

enum Command {
    Op(BulkOp),
    Flush(oneshot::Sender<()>),
}

pub struct BulkIngester {
    tx: mpsc::Sender<Command>,
    capacity: usize,
    worker: JoinHandle<()>,
}

impl BulkIngester {
    pub fn new(backend: Arc<dyn SearchBackend>, config: IngestConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let capacity = config.queue_capacity;
        let worker = tokio::spawn(run_worker(backend, config, rx));
        BulkIngester {
            tx,
            capacity,
            worker,
        }
    }

    /// Queues an operation without waiting. Fails fast when the queue is at
    /// capacity so a stalled backend surfaces as backpressure instead of
    /// unbounded memory growth.
    pub fn submit(&self, op: BulkOp) -> Result<()> {
        self.tx.try_send(Command::Op(op)).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => GriddleError::QueueFull(self.capacity),
            mpsc::error::TrySendError::Closed(_) => GriddleError::QueueClosed,
        })
    }

    /// Queues an operation, waiting for capacity.
    pub async fn enqueue(&self, op: BulkOp) -> Result<()> {
        self.tx
            .send(Command::Op(op))
            .await
            .map_err(|_| GriddleError::QueueClosed)
    }

    /// Ships everything queued so far and waits for the shipment to finish.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack_tx))
            .await
            .map_err(|_| GriddleError::QueueClosed)?;
        ack_rx.await.map_err(|_| GriddleError::QueueClosed)
    }

    /// Flushes the remaining queue and stops the worker.
    pub async fn close(self) -> Result<()> {
        drop(self.tx);
        self.worker.await.map_err(|_| GriddleError::QueueClosed)
    }
}

async fn run_worker(
    backend: Arc<dyn SearchBackend>,
    config: IngestConfig,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut batch: Vec<BulkOp> = Vec::new();
    let mut batch_bytes = 0usize;
    let mut next_flush = Instant::now() + config.flush_interval;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Op(op)) => {
                    batch_bytes += op.estimated_bytes();
                    batch.push(op);
                    if batch.len() >= config.bulk_actions || batch_bytes >= config.bulk_size {
                        ship(&*backend, &config.backoff_policy, &mut batch, &mut batch_bytes).await;
                        next_flush = Instant::now() + config.flush_interval;
                    }
                }
                Some(Command::Flush(ack)) => {
                    ship(&*backend, &config.backoff_policy, &mut batch, &mut batch_bytes).await;
                    next_flush = Instant::now() + config.flush_interval;
                    let _ = ack.send(());
                }
                None => {
                    ship(&*backend, &config.backoff_policy, &mut batch, &mut batch_bytes).await;
                    return;
                }
            },
            _ = tokio::time::sleep_until(next_flush) => {
                if !batch.is_empty() {
                    ship(&*backend, &config.backoff_policy, &mut batch, &mut batch_bytes).await;
                }
                next_flush = Instant::now() + config.flush_interval;
            }
        }
    }
}

async fn ship(
    backend: &dyn SearchBackend,
    backoff: &BackoffPolicy,
    batch: &mut Vec<BulkOp>,
    batch_bytes: &mut usize,
) {
    if batch.is_empty() {
        return;
    }
    let ops = std::mem::take(batch);
    *batch_bytes = 0;
    let count = ops.len();

    let mut attempt = 0u32;
    loop {
        match backend.bulk(ops.clone()).await {
            Ok(()) => {
                tracing::debug!(count, "bulk flush shipped");
                return;
            }
            Err(err) => {
                attempt += 1;
                match backoff.delay_for(attempt) {
                    Some(delay) => {
                        tracing::warn!(count, attempt, error = %err, "bulk flush failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(count, error = %err, "bulk flush failed, dropping batch");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use crate::backend::{
        AliasSpec, AliasTarget, GetResult, SearchBackend, SearchResults, TaskInfo, WriteOptions,
        WriteResponse,
    };
    use crate::query::Query;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Rejects the first N bulk requests, then behaves like the in-memory
    /// backend.
    struct FlakyBulkBackend {
        inner: Arc<InMemoryBackend>,
        failures_left: AtomicU32,
    }

    impl FlakyBulkBackend {
        fn new(inner: Arc<InMemoryBackend>, failures: u32) -> Self {
            FlakyBulkBackend {
                inner,
                failures_left: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait::async_trait]
    impl SearchBackend for FlakyBulkBackend {
        async fn bulk(&self, ops: Vec<BulkOp>) -> crate::error::Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(GriddleError::Backend("bulk rejected".into()));
            }
            self.inner.bulk(ops).await
        }

        async fn get(&self, index: &str, id: &str) -> crate::error::Result<Option<GetResult>> {
            self.inner.get(index, id).await
        }

        async fn index(
            &self,
            index: &str,
            id: &str,
            document: &Value,
            options: &WriteOptions,
        ) -> crate::error::Result<WriteResponse> {
            self.inner.index(index, id, document, options).await
        }

        async fn update(
            &self,
            index: &str,
            id: &str,
            doc: &Value,
            options: &WriteOptions,
        ) -> crate::error::Result<WriteResponse> {
            self.inner.update(index, id, doc, options).await
        }

        async fn delete(&self, index: &str, id: &str) -> crate::error::Result<bool> {
            self.inner.delete(index, id).await
        }

        async fn search(
            &self,
            index: &str,
            query: &Query,
            size: usize,
        ) -> crate::error::Result<SearchResults> {
            self.inner.search(index, query, size).await
        }

        async fn count(&self, index: &str, query: &Query) -> crate::error::Result<u64> {
            self.inner.count(index, query).await
        }

        async fn delete_by_query(
            &self,
            index: &str,
            query: &Query,
        ) -> crate::error::Result<String> {
            self.inner.delete_by_query(index, query).await
        }

        async fn update_by_query(
            &self,
            index: &str,
            query: &Query,
            script: &str,
            params: &Value,
        ) -> crate::error::Result<String> {
            self.inner.update_by_query(index, query, script, params).await
        }

        async fn task_status(&self, task_id: &str) -> crate::error::Result<TaskInfo> {
            self.inner.task_status(task_id).await
        }

        async fn create_index(
            &self,
            name: &str,
            settings: &Value,
            aliases: &[AliasSpec],
        ) -> crate::error::Result<()> {
            self.inner.create_index(name, settings, aliases).await
        }

        async fn delete_index(&self, name: &str) -> crate::error::Result<bool> {
            self.inner.delete_index(name).await
        }

        async fn index_exists(&self, name: &str) -> crate::error::Result<bool> {
            self.inner.index_exists(name).await
        }

        async fn resolve_alias(&self, alias: &str) -> crate::error::Result<Vec<AliasTarget>> {
            self.inner.resolve_alias(alias).await
        }

        async fn put_index_template(&self, name: &str, body: &Value) -> crate::error::Result<()> {
            self.inner.put_index_template(name, body).await
        }

        async fn index_template_exists(&self, name: &str) -> crate::error::Result<bool> {
            self.inner.index_template_exists(name).await
        }

        async fn get_index_settings(&self, index: &str) -> crate::error::Result<Value> {
            self.inner.get_index_settings(index).await
        }

        async fn put_lifecycle_policy(
            &self,
            name: &str,
            body: &Value,
        ) -> crate::error::Result<bool> {
            self.inner.put_lifecycle_policy(name, body).await
        }

        async fn lifecycle_policy_exists(&self, name: &str) -> crate::error::Result<bool> {
            self.inner.lifecycle_policy_exists(name).await
        }
    }

    fn index_op(id: &str) -> BulkOp {
        BulkOp::Index {
            index: "items".into(),
            id: id.into(),
            document: json!({"id": id}),
            options: WriteOptions::default(),
        }
    }

    fn config() -> IngestConfig {
        IngestConfig {
            flush_interval: Duration::from_secs(60),
            ..IngestConfig::default()
        }
    }

    #[tokio::test]
    async fn explicit_flush_ships_queued_operations() {
        let backend = Arc::new(InMemoryBackend::new());
        let ingester = BulkIngester::new(backend.clone(), config());

        ingester.submit(index_op("a")).unwrap();
        ingester.submit(index_op("b")).unwrap();
        assert_eq!(backend.doc_count("items"), 0);

        ingester.flush().await.unwrap();
        assert_eq!(backend.doc_count("items"), 2);
        ingester.close().await.unwrap();
    }

    #[tokio::test]
    async fn count_threshold_triggers_a_flush() {
        let backend = Arc::new(InMemoryBackend::new());
        let ingester = BulkIngester::new(
            backend.clone(),
            IngestConfig {
                bulk_actions: 2,
                ..config()
            },
        );

        ingester.enqueue(index_op("a")).await.unwrap();
        ingester.enqueue(index_op("b")).await.unwrap();

        // The worker flushes asynchronously once the second op arrives.
        for _ in 0..50 {
            if backend.doc_count("items") == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.doc_count("items"), 2);
        ingester.close().await.unwrap();
    }

    #[tokio::test]
    async fn byte_threshold_triggers_a_flush() {
        let backend = Arc::new(InMemoryBackend::new());
        let ingester = BulkIngester::new(
            backend.clone(),
            IngestConfig {
                bulk_size: 64,
                ..config()
            },
        );

        let big = BulkOp::Index {
            index: "items".into(),
            id: "a".into(),
            document: json!({"payload": "x".repeat(128)}),
            options: WriteOptions::default(),
        };
        ingester.enqueue(big).await.unwrap();

        for _ in 0..50 {
            if backend.doc_count("items") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.doc_count("items"), 1);
        ingester.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_flush_retries_per_policy() {
        let inner = Arc::new(InMemoryBackend::new());
        let flaky = Arc::new(FlakyBulkBackend::new(inner.clone(), 2));
        let ingester = BulkIngester::new(
            flaky,
            IngestConfig {
                backoff_policy: BackoffPolicy::Constant {
                    delay: Duration::from_millis(1),
                    max_retries: 3,
                },
                ..config()
            },
        );

        ingester.submit(index_op("a")).unwrap();
        // The flush ack only arrives after the retry schedule resolves.
        ingester.flush().await.unwrap();
        assert_eq!(inner.doc_count("items"), 1);
        ingester.close().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_backoff_drops_the_batch_without_wedging_the_queue() {
        let inner = Arc::new(InMemoryBackend::new());
        let flaky = Arc::new(FlakyBulkBackend::new(inner.clone(), 3));
        let ingester = BulkIngester::new(
            flaky,
            IngestConfig {
                backoff_policy: BackoffPolicy::Constant {
                    delay: Duration::from_millis(1),
                    max_retries: 1,
                },
                ..config()
            },
        );

        // First attempt plus one retry both fail; the batch is dropped.
        ingester.submit(index_op("a")).unwrap();
        ingester.flush().await.unwrap();
        assert_eq!(inner.doc_count("items"), 0);

        // The worker keeps serving: the next batch fails once more, then
        // lands on its retry.
        ingester.submit(index_op("b")).unwrap();
        ingester.flush().await.unwrap();
        assert_eq!(inner.doc_count("items"), 1);
        assert!(inner.get("items", "b").await.unwrap().is_some());
        assert!(inner.get("items", "a").await.unwrap().is_none());
        ingester.close().await.unwrap();
    }

    #[tokio::test]
    async fn interval_flushes_a_partial_batch() {
        let backend = Arc::new(InMemoryBackend::new());
        let ingester = BulkIngester::new(
            backend.clone(),
            IngestConfig {
                flush_interval: Duration::from_millis(50),
                ..IngestConfig::default()
            },
        );

        ingester.enqueue(index_op("a")).await.unwrap();
        for _ in 0..50 {
            if backend.doc_count("items") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.doc_count("items"), 1);
        ingester.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_flushes_the_remainder() {
        let backend = Arc::new(InMemoryBackend::new());
        let ingester = BulkIngester::new(backend.clone(), config());
        ingester.submit(index_op("a")).unwrap();
        ingester.close().await.unwrap();
        assert_eq!(backend.doc_count("items"), 1);
    }

    #[tokio::test]
    async fn full_queue_fails_fast() {
        let backend = Arc::new(InMemoryBackend::new());
        let ingester = BulkIngester::new(
            backend,
            IngestConfig {
                queue_capacity: 1,
                bulk_actions: 100,
                ..config()
            },
        );

        // Single-threaded test runtime: the worker cannot drain between
        // consecutive non-awaiting submits.
        ingester.submit(index_op("a")).unwrap();
        let err = ingester.submit(index_op("b")).unwrap_err();
        assert!(matches!(err, GriddleError::QueueFull(1)));
        ingester.close().await.unwrap();
    }
}
