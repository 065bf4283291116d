//! End-to-end pipeline tests: HTTP ingest through the worker into the
//! store, the push path against a live receiver, and the health
//! contract. Servers bind to port 0 so tests run in parallel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::Json;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use octrace::ingest::{worker::Worker, IngestQueue, QUEUE_CAPACITY};
use octrace::push::Pusher;
use octrace::runtime::PushState;
use octrace::server::{self, AppContext};
use octrace::store::{Store, TraceInsert};
use tokio_util::sync::CancellationToken;

struct TestApp {
    _dir: tempfile::TempDir,
    store: Arc<Store>,
    queue: Arc<IngestQueue>,
    base_url: String,
    http_cancel: CancellationToken,
    worker_handle: Option<tokio::task::JoinHandle<anyhow::Result<()>>>,
    /// Held (undrained) when the test runs without a worker.
    _rx: Option<tokio::sync::mpsc::Receiver<octrace::ingest::Event>>,
}

impl TestApp {
    /// Store + worker + HTTP server on a random port, push disabled.
    async fn spawn() -> Self {
        Self::spawn_with_queue_capacity(QUEUE_CAPACITY, true).await
    }

    async fn spawn_with_queue_capacity(capacity: usize, with_worker: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("trace.db")).await.unwrap());
        let (queue, rx) = IngestQueue::with_capacity(capacity);

        let (worker_handle, held_rx) = if with_worker {
            let worker = Worker::new(store.clone(), 16 * 1024);
            (Some(tokio::spawn(worker.run(rx))), None)
        } else {
            (None, Some(rx))
        };

        let ctx = Arc::new(AppContext {
            store: store.clone(),
            queue: queue.clone(),
            push_state: Arc::new(PushState::new(false)),
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let http_cancel = CancellationToken::new();
        tokio::spawn(server::serve(listener, ctx, http_cancel.clone()));

        Self {
            _dir: dir,
            store,
            queue,
            base_url: format!("http://{addr}"),
            http_cancel,
            worker_handle,
            _rx: held_rx,
        }
    }

    async fn shutdown(mut self) {
        self.http_cancel.cancel();
        self.queue.close();
        if let Some(handle) = self.worker_handle.take() {
            handle.await.unwrap().unwrap();
        }
    }
}

/// Receiver that counts requests and events and answers `status`.
async fn spawn_receiver(status: StatusCode) -> (String, Arc<AtomicUsize>) {
    let events_seen = Arc::new(AtomicUsize::new(0));
    let seen = events_seen.clone();
    let app = Router::new().route(
        "/v1/ingest",
        post(move |Json(payload): Json<serde_json::Value>| {
            let seen = seen.clone();
            async move {
                if let Some(events) = payload["events"].as_array() {
                    for event in events {
                        assert!(
                            event["data"]["trace_id"].is_string(),
                            "trace_id missing in pushed event"
                        );
                    }
                    seen.fetch_add(events.len(), Ordering::SeqCst);
                }
                status
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/v1/ingest"), events_seen)
}

#[tokio::test]
async fn trace_round_trip_via_http() {
    let app = TestApp::spawn().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/traces", app.base_url))
        .json(&serde_json::json!({
            "provider": "anthropic",
            "model": "claude-sonnet-4",
            "input_text": "hello",
            "output_text": "world",
            "prompt_tokens": 10,
            "completion_tokens": 20,
            "total_tokens": 30,
            "cost_usd": 0.12,
            "latency_ms": 150,
            "status": "ok"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    // One flush window plus slack.
    tokio::time::sleep(Duration::from_millis(650)).await;

    assert_eq!(app.store.trace_count().await.unwrap(), 1);
    let row = app.store.latest_trace().await.unwrap().unwrap();
    assert_eq!(row.trace_id.len(), 36);
    assert_eq!(row.provider, "anthropic");
    assert_eq!(row.model, "claude-sonnet-4");
    assert_eq!(row.input_text, "hello");
    assert_eq!(row.output_text, "world");
    assert_eq!(row.prompt_tokens, 10);
    assert_eq!(row.completion_tokens, 20);
    assert_eq!(row.total_tokens, 30);
    assert_eq!(row.latency_ms, 150);
    assert_eq!(row.status, "ok");

    app.shutdown().await;
}

#[tokio::test]
async fn invalid_bodies_get_400_valid_get_202() {
    let app = TestApp::spawn().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/v1/traces", app.base_url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    // Missing provider/model.
    let resp = client
        .post(format!("{}/v1/traces", app.base_url))
        .json(&serde_json::json!({"input_text": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("{}/v1/errors", app.base_url))
        .json(&serde_json::json!({"error_type": "llm_error"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("{}/v1/errors", app.base_url))
        .json(&serde_json::json!({"error_type": "llm_error", "message": "rate limited"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    app.shutdown().await;
}

#[tokio::test]
async fn queue_saturation_still_returns_202() {
    // Capacity 1, no worker draining: the second post must drop.
    let app = TestApp::spawn_with_queue_capacity(1, false).await;
    let client = reqwest::Client::new();
    let body = serde_json::json!({"provider": "anthropic", "model": "claude"});

    for _ in 0..2 {
        let resp = client
            .post(format!("{}/v1/traces", app.base_url))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    }

    assert_eq!(app.queue.events_received(), 1);
    assert_eq!(app.queue.events_dropped(), 1);
}

#[tokio::test]
async fn health_contract_on_fresh_store() {
    let app = TestApp::spawn().await;

    let resp = reqwest::get(format!("{}/health", app.base_url)).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = resp.json().await.unwrap();

    for key in [
        "status",
        "uptime_seconds",
        "version",
        "db_status",
        "db_size_bytes",
        "wal_size_bytes",
        "queue_depth",
        "events_received",
        "events_dropped",
        "last_push_time",
        "last_push_status",
        "unsynced_count",
        "generated_at",
        "warnings",
    ] {
        assert!(body.get(key).is_some(), "missing health field {key:?}");
    }
    assert_eq!(body["status"], "ok");
    assert_eq!(body["last_push_status"], "disabled");
    assert!(body["last_push_time"].is_null());
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    app.shutdown().await;
}

#[tokio::test]
async fn push_pipeline_hundred_traces() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join("trace.db")).await.unwrap());

    let base = chrono::Utc::now().timestamp_millis();
    for i in 0..100 {
        store
            .insert_batch(
                &[TraceInsert {
                    trace_id: format!("00000000-0000-4000-8000-{i:012}"),
                    created_at: base + i as i64,
                    provider: "anthropic".into(),
                    model: "claude-sonnet-4".into(),
                    input_text: "input".into(),
                    output_text: "output".into(),
                    prompt_tokens: 21,
                    completion_tokens: 21,
                    total_tokens: 42,
                    status: "ok".into(),
                    ..Default::default()
                }],
                &[],
                &[],
            )
            .await
            .unwrap();
    }

    let (url, seen) = spawn_receiver(StatusCode::OK).await;
    let pusher = Pusher::new(store.clone(), url, 5 * 1024 * 1024)
        .unwrap()
        .retry_policy(2, Duration::from_millis(1));

    let res = pusher.push_once().await.unwrap();
    assert!(res.events_sent >= 100);
    assert!(seen.load(Ordering::SeqCst) >= 100);
    assert_eq!(store.pending_counts().await.unwrap(), (0, 0, 0));
}
