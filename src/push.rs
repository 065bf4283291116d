// SPDX-License-Identifier: MIT
//! Outbound push engine: at-least-once delivery of unsynced rows.
//!
//! One invocation fetches up to [`FETCH_LIMIT`] events in global
//! `created_at` order, packs them into payload-size-bounded batches, and
//! sends each with capped full-jitter retry. A batch is marked synced
//! only after the endpoint returned 200 for it; any failure aborts the
//! invocation and leaves the remaining rows unsynced for the next run.
//!
//! Duplicates on the receiver are possible when a response is lost after
//! the server processed a batch — that is the at-least-once tradeoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use serde_json::value::RawValue;
use tracing::warn;

use crate::store::{PushEvent, Store};

pub const FETCH_LIMIT: i64 = 5000;

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushResult {
    pub batches_sent: usize,
    pub events_sent: usize,
}

#[derive(Serialize)]
struct WireItem<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a RawValue,
}

struct Batch {
    events: Vec<PushEvent>,
    body: String,
}

pub struct Pusher {
    store: Arc<Store>,
    endpoint: String,
    client: reqwest::Client,
    max_payload_bytes: usize,
    max_retries: u32,
    base_backoff: Duration,
}

impl Pusher {
    pub fn new(store: Arc<Store>, endpoint: String, max_payload_bytes: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build push http client")?;
        Ok(Self {
            store,
            endpoint,
            client,
            max_payload_bytes,
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: DEFAULT_BASE_BACKOFF,
        })
    }

    /// Override the retry policy (tests use 1 ms backoff).
    pub fn retry_policy(mut self, max_retries: u32, base_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_backoff = base_backoff;
        self
    }

    /// One end-to-end push invocation. Cancellation arrives by wrapping
    /// the call in `tokio::time::timeout`; dropping the future aborts
    /// both the in-flight request and any backoff sleep.
    pub async fn push_once(&self) -> Result<PushResult> {
        if self.endpoint.is_empty() {
            bail!("push endpoint not configured");
        }

        let events = self.store.fetch_unsynced_events(FETCH_LIMIT).await?;
        if events.is_empty() {
            return Ok(PushResult::default());
        }

        let batches = build_batches(events, self.max_payload_bytes)?;
        let mut result = PushResult::default();
        for batch in batches {
            let started = Instant::now();
            self.send_with_retry(batch.body.as_bytes()).await?;
            let duration_ms = started.elapsed().as_millis() as i64;
            self.store
                .mark_events_synced(&batch.events, Utc::now().timestamp_millis(), duration_ms)
                .await?;
            result.batches_sent += 1;
            result.events_sent += batch.events.len();
        }
        Ok(result)
    }

    async fn send_with_retry(&self, body: &[u8]) -> Result<()> {
        let mut last_err = anyhow!("no attempts made");
        for attempt in 0..self.max_retries {
            let sent = self
                .client
                .post(&self.endpoint)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_vec())
                .send()
                .await;
            match sent {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => return Ok(()),
                Ok(resp) => last_err = anyhow!("push status {}", resp.status().as_u16()),
                Err(e) => last_err = anyhow::Error::new(e),
            }

            if attempt + 1 < self.max_retries {
                // Full jitter: uniform(0, base * 2^attempt), capped.
                let ceiling = self
                    .base_backoff
                    .saturating_mul(1u32 << attempt.min(16))
                    .min(MAX_BACKOFF);
                let sleep_ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
                warn!(
                    attempt = attempt + 1,
                    max = self.max_retries,
                    sleep_ms,
                    error = %last_err,
                    "push attempt failed, backing off"
                );
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
        }
        Err(last_err.context(format!("push failed after {} attempts", self.max_retries)))
    }
}

/// Pack events into envelopes no larger than `max_payload_bytes`.
///
/// A single event whose serialized item alone exceeds the cap still
/// ships, in a batch of one: better oversized than a stalled pipeline.
fn build_batches(events: Vec<PushEvent>, max_payload_bytes: usize) -> Result<Vec<Batch>> {
    const ENVELOPE_OVERHEAD: usize = r#"{"events":[]}"#.len();

    let mut out = Vec::new();
    let mut cur_events: Vec<PushEvent> = Vec::new();
    let mut cur_items: Vec<String> = Vec::new();
    let mut cur_size = ENVELOPE_OVERHEAD;

    fn seal(out: &mut Vec<Batch>, events: &mut Vec<PushEvent>, items: &mut Vec<String>, size: &mut usize) {
        if items.is_empty() {
            return;
        }
        out.push(Batch {
            events: std::mem::take(events),
            body: format!(r#"{{"events":[{}]}}"#, items.join(",")),
        });
        items.clear();
        *size = ENVELOPE_OVERHEAD;
    }

    for event in events {
        let item = serde_json::to_string(&WireItem {
            kind: event.table.wire_type(),
            data: &event.data,
        })
        .context("serialize push item")?;

        let separator = usize::from(!cur_items.is_empty());
        if !cur_items.is_empty() && cur_size + separator + item.len() > max_payload_bytes {
            seal(&mut out, &mut cur_events, &mut cur_items, &mut cur_size);
        }

        cur_size += item.len() + usize::from(!cur_items.is_empty());
        cur_items.push(item);
        cur_events.push(event);

        if cur_items.len() == 1 && cur_size > max_payload_bytes {
            seal(&mut out, &mut cur_events, &mut cur_items, &mut cur_size);
        }
    }
    seal(&mut out, &mut cur_events, &mut cur_items, &mut cur_size);
    Ok(out)
}
