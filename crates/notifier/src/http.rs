//! `/health` and `/stats` endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::tracker::{ResultTracker, TrackerSnapshot};

/// State shared across route handlers via Axum `State`.
#[derive(Clone)]
pub struct StatsState {
    pub tracker: Arc<ResultTracker>,
    pub queue_name: String,
}

pub fn create_router(state: StatsState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .with_state(state)
}

async fn health_check(State(state): State<StatsState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "gapless-notifier",
        "queue": state.queue_name,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn stats(State(state): State<StatsState>) -> Json<TrackerSnapshot> {
    Json(state.tracker.snapshot())
}

/// Serve the stats router until `shutdown` is cancelled.
pub async fn serve(
    state: StatsState,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Stats server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
