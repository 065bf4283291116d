//! Process lifecycle: wires the store, queue, worker, pusher, and
//! background loops together, then sequences shutdown.
//!
//! Shutdown order matters and is deliberate: the HTTP surface drains
//! first (no new producers), then the background loops stop (no new
//! pushes or maintenance), then the queue closes and the worker drains
//! its buffer, then one final push runs, and only then is the WAL
//! truncated and the store closed. Each step has its own budget; a step
//! timing out is recorded as a fault but never blocks the later steps.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::ingest::{worker::Worker, Enqueuer, IngestQueue};
use crate::logparse::LogTail;
use crate::metrics::MetricsSampler;
use crate::push::Pusher;
use crate::server::{self, AppContext};
use crate::store::Store;
use crate::tasks::{self, TickTask};

const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const LOOP_EXIT_TIMEOUT: Duration = Duration::from_secs(3);
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const PUSH_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_PUSH_TIMEOUT: Duration = Duration::from_secs(15);
const MAINTENANCE_TIMEOUT: Duration = Duration::from_secs(3);

// ─── Push status cells ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Disabled,
    Ready,
    Ok,
    Error,
}

impl PushStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PushStatus::Disabled => "disabled",
            PushStatus::Ready => "ready",
            PushStatus::Ok => "ok",
            PushStatus::Error => "error",
        }
    }
}

/// Shared between the push invocations (sole writers — the scheduled
/// loop and the shutdown push are serial by construction) and the health
/// projection (reader).
pub struct PushState {
    status: RwLock<PushStatus>,
    last_push_ms: AtomicI64,
}

impl PushState {
    pub fn new(enabled: bool) -> Self {
        Self {
            status: RwLock::new(if enabled {
                PushStatus::Ready
            } else {
                PushStatus::Disabled
            }),
            last_push_ms: AtomicI64::new(0),
        }
    }

    pub fn record_success(&self, at_ms: i64) {
        *self.status.write().unwrap() = PushStatus::Ok;
        self.last_push_ms.store(at_ms, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        *self.status.write().unwrap() = PushStatus::Error;
    }

    pub fn status(&self) -> PushStatus {
        *self.status.read().unwrap()
    }

    pub fn last_push_ms(&self) -> Option<i64> {
        let v = self.last_push_ms.load(Ordering::Relaxed);
        (v > 0).then_some(v)
    }
}

// ─── Background loop tasks ───────────────────────────────────────────────────

struct PushTask {
    pusher: Arc<Pusher>,
    state: Arc<PushState>,
    interval: Duration,
}

#[async_trait::async_trait]
impl TickTask for PushTask {
    fn name(&self) -> &'static str {
        "push"
    }
    fn period(&self) -> Duration {
        self.interval
    }
    // No supervisor timeout: the deadline lives inside the tick so a
    // timeout is recorded on the status cell like any other push failure.
    async fn tick(&mut self) -> Result<()> {
        let _ = run_push(&self.pusher, &self.state, PUSH_TIMEOUT, "scheduled").await;
        Ok(())
    }
}

struct CleanupTask {
    store: Arc<Store>,
    retention_days: u32,
    disk_threshold_pct: f64,
    db_threshold_bytes: i64,
    interval: Duration,
}

#[async_trait::async_trait]
impl TickTask for CleanupTask {
    fn name(&self) -> &'static str {
        "cleanup"
    }
    fn period(&self) -> Duration {
        self.interval
    }
    fn op_timeout(&self) -> Option<Duration> {
        Some(MAINTENANCE_TIMEOUT)
    }
    async fn tick(&mut self) -> Result<()> {
        let outcome = self
            .store
            .cleanup_old_synced(
                self.retention_days,
                self.disk_threshold_pct,
                self.db_threshold_bytes,
            )
            .await?;
        if outcome.did_run {
            info!(deleted = outcome.deleted, "retention pass completed");
        }
        Ok(())
    }
}

struct WalCheckpointTask {
    store: Arc<Store>,
    threshold_bytes: i64,
    interval: Duration,
}

#[async_trait::async_trait]
impl TickTask for WalCheckpointTask {
    fn name(&self) -> &'static str {
        "wal_checkpoint"
    }
    fn period(&self) -> Duration {
        self.interval
    }
    fn op_timeout(&self) -> Option<Duration> {
        Some(MAINTENANCE_TIMEOUT)
    }
    async fn tick(&mut self) -> Result<()> {
        if self.store.checkpoint_if_wal_exceeds(self.threshold_bytes).await? {
            info!("wal checkpoint (restart) completed");
        }
        Ok(())
    }
}

/// One push invocation under a deadline, with the outcome recorded on
/// the shared status cell.
async fn run_push(
    pusher: &Pusher,
    state: &PushState,
    budget: Duration,
    reason: &'static str,
) -> Result<()> {
    let outcome = match tokio::time::timeout(budget, pusher.push_once()).await {
        Ok(res) => res,
        Err(_) => Err(anyhow!("push timed out after {budget:?}")),
    };
    match outcome {
        Ok(res) => {
            state.record_success(Utc::now().timestamp_millis());
            info!(
                reason,
                batches = res.batches_sent,
                events = res.events_sent,
                "push completed"
            );
            Ok(())
        }
        Err(e) => {
            state.record_error();
            warn!(reason, "push failed: {e:#}");
            Err(e)
        }
    }
}

// ─── Runtime ─────────────────────────────────────────────────────────────────

pub struct Runtime {
    config: Config,
    version: &'static str,
}

impl Runtime {
    pub fn new(config: Config, version: &'static str) -> Self {
        Self { config, version }
    }

    /// Bring everything up, then wait for `cancel` (or an HTTP server
    /// failure) and run the shutdown sequence.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let started_at = Instant::now();
        let cfg = &self.config;

        let store = Arc::new(Store::open(&cfg.db_path).await.context("open database")?);
        let pragmas = store.pragmas().await.context("query sqlite pragmas")?;
        info!(
            path = %cfg.db_path.display(),
            journal_mode = pragmas.journal_mode,
            busy_timeout_ms = pragmas.busy_timeout_ms,
            auto_vacuum = pragmas.auto_vacuum,
            "sqlite opened"
        );

        let (queue, rx) = IngestQueue::new();
        let worker = Worker::new(store.clone(), cfg.max_text_bytes);
        let mut worker_handle: JoinHandle<Result<()>> = tokio::spawn(worker.run(rx));

        let pusher = match cfg.push_endpoint.as_deref() {
            Some(url) if !url.is_empty() => Some(Arc::new(Pusher::new(
                store.clone(),
                url.to_string(),
                cfg.push_max_payload_bytes,
            )?)),
            _ => None,
        };
        let push_state = Arc::new(PushState::new(pusher.is_some()));

        let enqueuer: Arc<dyn Enqueuer> = queue.clone();
        let mut loop_tasks: Vec<Box<dyn TickTask>> = vec![Box::new(MetricsSampler::new(
            cfg.metrics_interval,
            enqueuer.clone(),
            &cfg.db_path,
        ))];
        if let Some(log_path) = &cfg.log_path {
            loop_tasks.push(Box::new(LogTail::new(log_path.clone(), enqueuer.clone())));
        }
        if let Some(pusher) = &pusher {
            loop_tasks.push(Box::new(PushTask {
                pusher: pusher.clone(),
                state: push_state.clone(),
                interval: cfg.push_interval,
            }));
        }
        loop_tasks.push(Box::new(CleanupTask {
            store: store.clone(),
            retention_days: cfg.retention_days,
            disk_threshold_pct: cfg.cleanup_disk_threshold,
            db_threshold_bytes: cfg.cleanup_db_threshold_bytes,
            interval: cfg.cleanup_interval,
        }));
        loop_tasks.push(Box::new(WalCheckpointTask {
            store: store.clone(),
            threshold_bytes: cfg.wal_restart_threshold_bytes,
            interval: cfg.wal_checkpoint_interval,
        }));

        let bg_cancel = CancellationToken::new();
        let loop_handles = tasks::spawn_all(loop_tasks, &bg_cancel);

        let ctx = Arc::new(AppContext {
            store: store.clone(),
            queue: queue.clone(),
            push_state: push_state.clone(),
            started_at,
            version: self.version,
        });
        let listener = TcpListener::bind(("0.0.0.0", cfg.port))
            .await
            .with_context(|| format!("bind port {}", cfg.port))?;
        info!(addr = %listener.local_addr()?, "listening");
        let http_cancel = CancellationToken::new();
        let mut http_handle: JoinHandle<Result<()>> =
            tokio::spawn(server::serve(listener, ctx, http_cancel.clone()));

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested");
            }
            res = &mut http_handle => {
                bg_cancel.cancel();
                return match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.context("http server failed")),
                    Err(e) => Err(anyhow!("http server task panicked: {e}")),
                };
            }
        }

        // ─── Shutdown sequence ───────────────────────────────────────
        let mut faults: Vec<String> = Vec::new();
        info!(remaining = queue.depth(), "draining ingest queue");

        // 1. Drain the HTTP surface — no new producers after this point.
        http_cancel.cancel();
        match tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, &mut http_handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => faults.push(format!("http shutdown: {e:#}")),
            Ok(Err(e)) => faults.push(format!("http task join: {e}")),
            Err(_) => {
                http_handle.abort();
                faults.push("http shutdown timeout".to_string());
            }
        }

        // 2. Stop background loops so nothing else touches the store.
        bg_cancel.cancel();
        let loops_done = async {
            for handle in loop_handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(LOOP_EXIT_TIMEOUT, loops_done).await.is_err() {
            faults.push("background loop shutdown timeout".to_string());
        }

        // 3. Close the queue, then wait for the worker to flush what is
        //    left. The close must precede the wait: the worker only
        //    returns once the channel yields end-of-stream.
        queue.close();
        match tokio::time::timeout(WORKER_DRAIN_TIMEOUT, &mut worker_handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => faults.push(format!("worker shutdown: {e:#}")),
            Ok(Err(e)) => faults.push(format!("worker task join: {e}")),
            Err(_) => {
                worker_handle.abort();
                faults.push("worker drain timeout".to_string());
            }
        }

        // 4. One final push so a clean stop leaves nothing unsynced.
        if let Some(pusher) = &pusher {
            if let Err(e) =
                run_push(pusher, &push_state, SHUTDOWN_PUSH_TIMEOUT, "shutdown").await
            {
                faults.push(format!("final push: {e:#}"));
            }
        }

        // 5. Truncate the WAL and close both handles.
        if let Err(e) =
            tokio::time::timeout(MAINTENANCE_TIMEOUT, store.checkpoint_truncate())
                .await
                .map_err(|_| anyhow!("timed out"))
                .and_then(|r| r.map_err(Into::into))
        {
            faults.push(format!("wal checkpoint: {e:#}"));
        }
        store.close().await;

        info!(
            total_events = queue.events_received(),
            uptime = ?started_at.elapsed(),
            "shutdown complete"
        );

        if faults.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("shutdown completed with faults: {}", faults.join("; ")))
        }
    }
}
