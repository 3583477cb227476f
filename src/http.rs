use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use log::info;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::consumer::{self, EventConsumer};
use crate::engine::DetectionEngine;
use crate::errors::{DetectError, Result};

/// Thin observability surface over the pipeline; liveness is unconditional,
/// readiness mirrors the consumer's last known connectivity.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DetectionEngine>,
    pub consumer: Arc<EventConsumer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| DetectError::Config(format!("failed to bind http server: {}", e)))?;

    info!("http server listening on 0.0.0.0:{}", port);

    axum::serve(listener, app)
        .await
        .map_err(|e| DetectError::Config(format!("http server failed: {}", e)))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    if state.consumer.is_connected() {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not ready"})),
        )
    }
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "engine": state.engine.stats(),
        "pipeline": {
            "received": consumer::RECEIVED.load(Ordering::Relaxed),
            "alerts_published": consumer::ALERTS_PUBLISHED.load(Ordering::Relaxed),
            "dead_lettered": consumer::DEAD_LETTERED.load(Ordering::Relaxed),
            "errors": consumer::ERRORS.load(Ordering::Relaxed),
            "uptime_seconds": consumer::START_TIME.elapsed().as_secs(),
        }
    }))
}
