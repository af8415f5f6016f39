use crate::constants::{CLIENT_CHANNEL_CAPACITY, SSE_DONE_MARKER, SSE_KEEPALIVE_SECS};
use crate::health;
use crate::logging::request_id_middleware;
use crate::relay::{ChatRequest, TurnOutcome};
use crate::types::*;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::response::sse::{Event, KeepAlive};
use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::Instrument;

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/models", get(list_models))
        .route("/api/chat", post(chat_handler))
        .route("/chat/completions", post(chat_completions_passthrough))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness));

    if let Some(dir) = &state.args.static_dir {
        tracing::info!("Serving static UI from {}", dir.display());
        app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
    }

    app.layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn create_session(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let id = state.store.create().await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "session_id": id })),
    ))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    Json(state.store.list().await)
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>> {
    Ok(Json(state.store.get(&id).await?))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "default": state.registry.default_name(),
        "models": state.registry.names(),
    }))
}

async fn chat_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            tracing::warn!("[🖥️  -> ⚙️ ] Rejected chat body: {}", rejection.body_text());
            return ObservedError::from(RelayError::InvalidRequest(rejection.body_text()))
                .into_response();
        }
    };

    if req.stream {
        stream_chat(state, req)
    } else {
        collect_chat(state, req).await
    }
}

fn to_sse_event(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            tracing::error!("Failed to serialize {} event: {}", event.kind(), e);
            let fallback = StreamEvent::from_error(&RelayError::Serialization(e));
            match serde_json::to_string(&fallback) {
                Ok(json) => Event::default().data(json),
                Err(_) => Event::default().data(r#"{"type":"error","status":500,"code":"SERIALIZATION_ERROR","message":"unserializable event"}"#),
            }
        }
    }
}

fn stream_chat(state: Arc<AppState>, req: ChatRequest) -> Response {
    let (tx, rx) = mpsc::channel::<StreamEvent>(CLIENT_CHANNEL_CAPACITY);
    let relay = state.relay.clone();

    tokio::spawn(
        async move {
            match relay.handle(req, &tx).await {
                TurnOutcome::Completed(message) => {
                    tracing::debug!("Turn completed ({} chars)", message.content.len())
                }
                TurnOutcome::Failed(e) => tracing::debug!("Turn ended with {}", e.inner.code()),
                TurnOutcome::Cancelled => tracing::info!("Turn cancelled by client"),
            }
        }
        .instrument(tracing::Span::current()),
    );

    let events = ReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(to_sse_event(&event)))
        .chain(futures_util::stream::once(async {
            Ok::<_, Infallible>(Event::default().data(SSE_DONE_MARKER))
        }));

    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
                .text("keepalive"),
        )
        .into_response()
}

async fn collect_chat(state: Arc<AppState>, req: ChatRequest) -> Response {
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(CLIENT_CHANNEL_CAPACITY);
    let outcome = state.relay.handle(req, &tx).await;
    drop(tx);

    let mut terminal = None;
    while let Some(event) = rx.recv().await {
        if event.is_terminal() {
            terminal = Some(event);
        }
    }

    match terminal {
        Some(event) => {
            let status = match &event {
                StreamEvent::Error { status, .. } => match StatusCode::from_u16(*status) {
                    Ok(s) => s,
                    Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
                },
                _ => StatusCode::OK,
            };
            (status, Json(event)).into_response()
        }
        None => match outcome {
            TurnOutcome::Failed(e) => e.into_response(),
            _ => ObservedError::from(RelayError::Internal(
                "turn finished without a result".into(),
            ))
            .into_response(),
        },
    }
}

/// Raw OpenAI body in, upstream JSON out. `model` picks the target by registry name.
async fn chat_completions_passthrough(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return Err(RelayError::InvalidRequest(rejection.body_text()).into()),
    };

    let target = state
        .registry
        .resolve_or_default(body.get("model").and_then(|m| m.as_str()));
    let upstream_json = state.upstream.forward_raw(&target, body).await?;
    Ok(Json(upstream_json))
}
