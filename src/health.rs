use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub models: String,
    pub storage: String,
    pub sessions: usize,
    pub upstream: serde_json::Value,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let models_ok = !state.registry.is_empty();
    if !models_ok {
        tracing::error!("Readiness check: no models configured");
    }

    let storage_ok = match tokio::fs::metadata(state.store.dir()).await {
        Ok(meta) => meta.is_dir(),
        Err(e) => {
            tracing::error!(
                "Readiness check: data dir {} unavailable: {}",
                state.store.dir().display(),
                e
            );
            false
        }
    };

    let ready = models_ok && storage_ok;
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" }.to_string(),
            models: if models_ok { "ok" } else { "empty" }.to_string(),
            storage: if storage_ok { "ok" } else { "error" }.to_string(),
            sessions: state.store.len().await,
            upstream: state.health.snapshot(),
        }),
    )
}
