//! Health projection. Always 200, always the full key set; trouble shows
//! up as `status: "degraded"` plus a warning, never as a failed request.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use super::AppContext;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_seconds: i64,
    pub version: &'static str,
    pub db_status: &'static str,
    pub db_size_bytes: i64,
    pub wal_size_bytes: i64,
    pub queue_depth: i64,
    pub events_received: i64,
    pub events_dropped: i64,
    pub last_push_time: Option<i64>,
    pub last_push_status: &'static str,
    pub unsynced_count: i64,
    pub generated_at: String,
    pub warnings: Vec<&'static str>,
}

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<HealthResponse> {
    let stats = ctx.store.stats().await;
    let mut status = "ok";
    let mut warnings = Vec::new();

    let unsynced_count = match ctx.store.unsynced_count().await {
        Ok(n) => n,
        Err(_) => {
            status = "degraded";
            warnings.push("unsynced_count_unavailable");
            0
        }
    };
    if stats.db_status != "ok" {
        status = "degraded";
    }

    Json(HealthResponse {
        status,
        uptime_seconds: ctx.started_at.elapsed().as_secs() as i64,
        version: ctx.version,
        db_status: stats.db_status,
        db_size_bytes: stats.db_size_bytes,
        wal_size_bytes: stats.wal_size_bytes,
        queue_depth: ctx.queue.depth(),
        events_received: ctx.queue.events_received(),
        events_dropped: ctx.queue.events_dropped(),
        last_push_time: ctx.push_state.last_push_ms(),
        last_push_status: ctx.push_state.status().as_str(),
        unsynced_count,
        generated_at: Utc::now().to_rfc3339(),
        warnings,
    })
}
