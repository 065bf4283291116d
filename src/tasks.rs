// SPDX-License-Identifier: MIT
//! Uniform background loops.
//!
//! Every maintenance loop in the runtime has the same shape: a period, an
//! operation, and an optional per-operation deadline. [`spawn_all`] runs
//! each [`TickTask`] on its own tokio task until the shared cancellation
//! token fires; tick failures are logged, never fatal.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[async_trait]
pub trait TickTask: Send + 'static {
    fn name(&self) -> &'static str;

    fn period(&self) -> Duration;

    /// Deadline applied around each `tick`. `None` when the tick bounds
    /// itself (e.g. the push task, which must observe its own timeout to
    /// record it as a failed push).
    fn op_timeout(&self) -> Option<Duration> {
        None
    }

    async fn tick(&mut self) -> Result<()>;
}

pub fn spawn_all(
    tasks: Vec<Box<dyn TickTask>>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    tasks
        .into_iter()
        .map(|task| spawn_one(task, cancel.clone()))
        .collect()
}

fn spawn_one(mut task: Box<dyn TickTask>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(task.period());
        ticker.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let outcome = match task.op_timeout() {
                        Some(limit) => match tokio::time::timeout(limit, task.tick()).await {
                            Ok(res) => res,
                            Err(_) => Err(anyhow::anyhow!("timed out after {limit:?}")),
                        },
                        None => task.tick().await,
                    };
                    if let Err(e) = outcome {
                        warn!(task = task.name(), "background tick failed: {e:#}");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        hits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TickTask for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn period(&self) -> Duration {
            Duration::from_millis(10)
        }
        async fn tick(&mut self) -> Result<()> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn ticks_until_cancelled() {
        let hits = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let handles = spawn_all(
            vec![Box::new(Counting { hits: hits.clone() })],
            &cancel,
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        for h in handles {
            h.await.unwrap();
        }

        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, got {seen}");
        let after = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(hits.load(Ordering::SeqCst), after);
    }
}
