//! The single consumer between the queue and the store.
//!
//! Buffers incoming events and writes them in one transaction per
//! trigger: either the buffer reached [`MAX_BATCH_SIZE`] or a
//! [`FLUSH_WINDOW`] tick elapsed with a non-empty buffer. All store
//! writes from the ingest path funnel through this task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::error;
use uuid::Uuid;

use crate::store::{ErrorInsert, MetricInsert, Store, TraceInsert};

use super::{truncate_bytes, Event, EventPayload, FLUSH_WINDOW, MAX_BATCH_SIZE};

const INSERT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Worker {
    store: Arc<Store>,
    max_text_bytes: usize,
}

impl Worker {
    pub fn new(store: Arc<Store>, max_text_bytes: usize) -> Self {
        Self {
            store,
            max_text_bytes,
        }
    }

    /// Consume `rx` until the channel closes, then flush whatever is
    /// buffered. A flush failure ends the worker with an error; the
    /// runtime treats that as a shutdown fault.
    pub async fn run(self, mut rx: mpsc::Receiver<Event>) -> Result<()> {
        let mut ticker = tokio::time::interval(FLUSH_WINDOW);
        ticker.tick().await; // the first tick fires immediately

        let mut buffer: Vec<Event> = Vec::with_capacity(MAX_BATCH_SIZE);
        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(event) => {
                            buffer.push(event);
                            if buffer.len() >= MAX_BATCH_SIZE {
                                if let Err(e) = self.flush(&mut buffer).await {
                                    error!(error = %e, "ingest flush failed");
                                    return Err(e);
                                }
                            }
                        }
                        None => return self.flush(&mut buffer).await,
                    }
                }
                _ = ticker.tick() => {
                    if buffer.is_empty() {
                        continue;
                    }
                    if let Err(e) = self.flush(&mut buffer).await {
                        error!(error = %e, "ingest timed flush failed");
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<Event>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        let mut traces = Vec::new();
        let mut errors = Vec::new();
        let mut metrics = Vec::new();
        for event in buffer.drain(..) {
            // The id is worker-assigned; callers never supply one.
            let trace_id = Uuid::new_v4().to_string();
            let created_at = if event.created_at == 0 {
                Utc::now().timestamp_millis()
            } else {
                event.created_at
            };
            match event.payload {
                EventPayload::Trace(t) => traces.push(TraceInsert {
                    trace_id,
                    created_at,
                    provider: t.provider,
                    model: t.model,
                    input_text: truncate_bytes(&t.input_text, self.max_text_bytes).to_string(),
                    output_text: truncate_bytes(&t.output_text, self.max_text_bytes).to_string(),
                    prompt_tokens: t.prompt_tokens,
                    completion_tokens: t.completion_tokens,
                    total_tokens: t.total_tokens,
                    cost_usd: t.cost_usd,
                    latency_ms: t.latency_ms,
                    status: t.status,
                    error_type: t.error_type,
                    metadata: t.metadata,
                }),
                EventPayload::Error(e) => errors.push(ErrorInsert {
                    trace_id,
                    created_at,
                    error_type: e.error_type,
                    message: e.message,
                    stack_trace: e.stack_trace,
                    severity: e.severity,
                    metadata: e.metadata,
                }),
                EventPayload::Metric(m) => metrics.push(MetricInsert {
                    trace_id,
                    created_at,
                    cpu_pct: m.cpu_pct,
                    mem_rss_bytes: m.mem_rss_bytes,
                    mem_available: m.mem_available,
                    mem_total: m.mem_total,
                    disk_used_bytes: m.disk_used_bytes,
                    disk_total_bytes: m.disk_total_bytes,
                    disk_free_bytes: m.disk_free_bytes,
                    metadata: m.metadata,
                }),
            }
        }

        tokio::time::timeout(
            INSERT_TIMEOUT,
            self.store.insert_batch(&traces, &errors, &metrics),
        )
        .await
        .context("insert batch timed out")?
        .context("insert batch")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{IngestQueue, TracePayload, QUEUE_CAPACITY};
    use crate::ingest::Enqueuer;

    async fn open_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("trace.db")).await.unwrap();
        (dir, Arc::new(store))
    }

    fn trace_event(input: &str, output: &str) -> Event {
        Event {
            created_at: 0,
            payload: EventPayload::Trace(TracePayload {
                provider: "anthropic".into(),
                model: "claude-sonnet-4".into(),
                input_text: input.into(),
                output_text: output.into(),
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
                cost_usd: 0.0,
                latency_ms: 0,
                status: "ok".into(),
                error_type: String::new(),
                metadata: String::new(),
            }),
        }
    }

    #[tokio::test]
    async fn flushes_on_window() {
        let (_dir, store) = open_store().await;
        let (queue, rx) = IngestQueue::with_capacity(QUEUE_CAPACITY);
        let worker = Worker::new(store.clone(), 1024);
        let handle = tokio::spawn(worker.run(rx));

        assert!(queue.enqueue(trace_event("hello", "world")));
        tokio::time::sleep(Duration::from_millis(650)).await;

        assert_eq!(store.trace_count().await.unwrap(), 1);

        queue.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn generates_trace_id_and_truncates_text() {
        let (_dir, store) = open_store().await;
        let (queue, rx) = IngestQueue::with_capacity(QUEUE_CAPACITY);
        let worker = Worker::new(store.clone(), 8);
        let handle = tokio::spawn(worker.run(rx));

        assert!(queue.enqueue(trace_event("0123456789abcdef", "abcdefghijk")));
        queue.close();
        handle.await.unwrap().unwrap();

        let row = store.latest_trace().await.unwrap().unwrap();
        assert_eq!(row.trace_id.len(), 36);
        assert_eq!(row.input_text.len(), 8);
        assert_eq!(row.output_text.len(), 8);
    }

    #[tokio::test]
    async fn substitutes_wall_clock_for_zero_created_at() {
        let (_dir, store) = open_store().await;
        let (queue, rx) = IngestQueue::with_capacity(QUEUE_CAPACITY);
        let worker = Worker::new(store.clone(), 1024);
        let handle = tokio::spawn(worker.run(rx));

        let before = Utc::now().timestamp_millis();
        assert!(queue.enqueue(trace_event("x", "y")));
        queue.close();
        handle.await.unwrap().unwrap();

        let created_at: i64 = sqlx::query_scalar("SELECT created_at FROM llm_traces LIMIT 1")
            .fetch_one(store.reader())
            .await
            .unwrap();
        assert!(created_at >= before);
    }

    #[tokio::test]
    async fn drains_remaining_buffer_on_close() {
        let (_dir, store) = open_store().await;
        let (queue, rx) = IngestQueue::with_capacity(QUEUE_CAPACITY);
        let worker = Worker::new(store.clone(), 1024);
        let handle = tokio::spawn(worker.run(rx));

        for _ in 0..7 {
            assert!(queue.enqueue(trace_event("a", "b")));
        }
        queue.close();
        handle.await.unwrap().unwrap();

        assert_eq!(store.trace_count().await.unwrap(), 7);
    }
}
