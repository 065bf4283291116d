//! HTTP surface: health plus the two ingest routes.
//!
//! The handlers are thin adapters — decode, validate, enqueue, 202. No
//! handler ever waits on the store; back-pressure is invisible here by
//! design and only shows up in the drop counter.

pub mod health;
pub mod ingest;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;

use crate::ingest::IngestQueue;
use crate::runtime::PushState;
use crate::store::Store;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything the handlers need: the enqueue capability plus read-only
/// snapshot sources for the health projection.
pub struct AppContext {
    pub store: Arc<Store>,
    pub queue: Arc<IngestQueue>,
    pub push_state: Arc<PushState>,
    pub started_at: Instant,
    pub version: &'static str,
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/v1/traces", post(ingest::post_trace))
        .route("/v1/errors", post(ingest::post_error))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(ctx)
}

/// Serve until `shutdown` fires, then drain in-flight connections.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
