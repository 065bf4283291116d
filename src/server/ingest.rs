//! POST /v1/traces and /v1/errors.
//!
//! Both return 202 whenever the body decodes and carries its required
//! fields — even when the queue drops the event. Producers are never
//! slowed or failed by storage trouble; drops are visible only through
//! `events_dropped` on the health surface.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use super::AppContext;
use crate::ingest::{Enqueuer, ErrorPayload, Event, EventPayload, TracePayload};

#[derive(Debug, Deserialize)]
pub struct TraceRequest {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input_text: String,
    #[serde(default)]
    pub output_text: String,
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub latency_ms: i64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub metadata: String,
}

#[derive(Debug, Deserialize)]
pub struct ErrorRequest {
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub stack_trace: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub metadata: String,
}

pub async fn post_trace(
    State(ctx): State<Arc<AppContext>>,
    payload: Result<Json<TraceRequest>, JsonRejection>,
) -> (StatusCode, &'static str) {
    let Ok(Json(req)) = payload else {
        return (StatusCode::BAD_REQUEST, "invalid json");
    };
    if req.provider.is_empty() || req.model.is_empty() {
        return (StatusCode::BAD_REQUEST, "provider and model are required");
    }
    let status = if req.status.is_empty() {
        "ok".to_string()
    } else {
        req.status
    };

    ctx.queue.enqueue(Event {
        created_at: Utc::now().timestamp_millis(),
        payload: EventPayload::Trace(TracePayload {
            provider: req.provider,
            model: req.model,
            input_text: req.input_text,
            output_text: req.output_text,
            prompt_tokens: req.prompt_tokens,
            completion_tokens: req.completion_tokens,
            total_tokens: req.total_tokens,
            cost_usd: req.cost_usd,
            latency_ms: req.latency_ms,
            status,
            error_type: req.error_type,
            metadata: req.metadata,
        }),
    });

    (StatusCode::ACCEPTED, "")
}

pub async fn post_error(
    State(ctx): State<Arc<AppContext>>,
    payload: Result<Json<ErrorRequest>, JsonRejection>,
) -> (StatusCode, &'static str) {
    let Ok(Json(req)) = payload else {
        return (StatusCode::BAD_REQUEST, "invalid json");
    };
    if req.error_type.is_empty() || req.message.is_empty() {
        return (StatusCode::BAD_REQUEST, "error_type and message are required");
    }
    let severity = if req.severity.is_empty() {
        "error".to_string()
    } else {
        req.severity
    };

    ctx.queue.enqueue(Event {
        created_at: Utc::now().timestamp_millis(),
        payload: EventPayload::Error(ErrorPayload {
            error_type: req.error_type,
            message: req.message,
            stack_trace: req.stack_trace,
            severity,
            metadata: req.metadata,
        }),
    });

    (StatusCode::ACCEPTED, "")
}
