//! Ingest entry: the event sum type, the bounded non-blocking queue,
//! and byte-cap truncation.
//!
//! Producers never block and are never told about downstream trouble
//! beyond the drop counter: `enqueue` either buffers the event or drops
//! it on the floor and increments `events_dropped`.

pub mod worker;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

pub const QUEUE_CAPACITY: usize = 512;
pub const MAX_BATCH_SIZE: usize = 50;
pub const FLUSH_WINDOW: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct TracePayload {
    pub provider: String,
    pub model: String,
    pub input_text: String,
    pub output_text: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub status: String,
    pub error_type: String,
    pub metadata: String,
}

#[derive(Debug, Clone)]
pub struct ErrorPayload {
    pub error_type: String,
    pub message: String,
    pub stack_trace: String,
    pub severity: String,
    pub metadata: String,
}

#[derive(Debug, Clone, Default)]
pub struct MetricPayload {
    pub cpu_pct: f64,
    pub mem_rss_bytes: i64,
    pub mem_available: i64,
    pub mem_total: i64,
    pub disk_used_bytes: i64,
    pub disk_total_bytes: i64,
    pub disk_free_bytes: i64,
    pub metadata: String,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Trace(TracePayload),
    Error(ErrorPayload),
    Metric(MetricPayload),
}

/// One queued event. `created_at` is producer-assigned epoch ms; zero
/// means the worker substitutes wall-clock at buffering time.
#[derive(Debug, Clone)]
pub struct Event {
    pub created_at: i64,
    pub payload: EventPayload,
}

/// The one-method capability producers depend on. Handlers, the log
/// parser, and the metrics sampler all hold this instead of the runtime.
pub trait Enqueuer: Send + Sync {
    fn enqueue(&self, event: Event) -> bool;
}

/// Bounded FIFO handle shared by all producers. Closing takes the
/// sender out, so late enqueues fail fast and count as drops.
pub struct IngestQueue {
    tx: RwLock<Option<mpsc::Sender<Event>>>,
    received: AtomicI64,
    dropped: AtomicI64,
}

impl IngestQueue {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Event>) {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx: RwLock::new(Some(tx)),
                received: AtomicI64::new(0),
                dropped: AtomicI64::new(0),
            }),
            rx,
        )
    }

    /// Events currently buffered in the channel.
    pub fn depth(&self) -> i64 {
        match self.tx.read().unwrap().as_ref() {
            Some(tx) => (tx.max_capacity() - tx.capacity()) as i64,
            None => 0,
        }
    }

    pub fn events_received(&self) -> i64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> i64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drop the sender so the worker sees end-of-stream and drains.
    pub fn close(&self) {
        self.tx.write().unwrap().take();
    }
}

impl Enqueuer for IngestQueue {
    fn enqueue(&self, event: Event) -> bool {
        let guard = self.tx.read().unwrap();
        let Some(tx) = guard.as_ref() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => {
                self.received.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Truncate `input` to at most `max_bytes` bytes. Rust strings cannot
/// carry a split codepoint, so the cut backs up to the nearest char
/// boundary; ASCII input truncates byte-exactly.
pub fn truncate_bytes(input: &str, max_bytes: usize) -> &str {
    if max_bytes == 0 {
        return "";
    }
    if input.len() <= max_bytes {
        return input;
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_event() -> Event {
        Event {
            created_at: 0,
            payload: EventPayload::Trace(TracePayload {
                provider: "a".into(),
                model: "b".into(),
                input_text: String::new(),
                output_text: String::new(),
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
    async fn enqueue_drops_when_saturated() {
        let (queue, _rx) = IngestQueue::with_capacity(1);

        assert!(queue.enqueue(trace_event()));
        assert!(!queue.enqueue(trace_event()));
        assert_eq!(queue.events_received(), 1);
        assert_eq!(queue.events_dropped(), 1);
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn default_capacity_is_exactly_512() {
        let (queue, _rx) = IngestQueue::new();
        for _ in 0..QUEUE_CAPACITY {
            assert!(queue.enqueue(trace_event()));
        }
        assert!(!queue.enqueue(trace_event()));
        assert_eq!(queue.events_received(), 512);
        assert_eq!(queue.events_dropped(), 1);
    }

    #[tokio::test]
    async fn enqueue_after_close_counts_as_drop() {
        let (queue, _rx) = IngestQueue::with_capacity(4);
        queue.close();
        assert!(!queue.enqueue(trace_event()));
        assert_eq!(queue.events_dropped(), 1);
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn truncate_is_byte_exact_for_ascii() {
        assert_eq!(truncate_bytes("0123456789abcdef", 8), "01234567");
        assert_eq!(truncate_bytes("short", 8), "short");
        assert_eq!(truncate_bytes("anything", 0), "");
    }

    #[test]
    fn truncate_backs_up_to_char_boundary() {
        // "héllo": 'é' spans bytes 1..3; a cap of 2 lands mid-codepoint.
        let s = "héllo";
        assert_eq!(truncate_bytes(s, 2), "h");
        assert_eq!(truncate_bytes(s, 3), "hé");
        assert!(truncate_bytes(s, 2).len() <= 2);
    }
}
