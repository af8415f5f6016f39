#![allow(dead_code)]

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use chat_relay::config::RelayConfig;
use chat_relay::constants::MAX_LINE_BYTES;
use chat_relay::registry::ModelRegistry;
use chat_relay::relay::{ChatRequest, TurnOutcome};
use chat_relay::store::SessionStore;
use chat_relay::upstream::UpstreamClient;
use chat_relay::*;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub scenario: String,
    pub authorization: Option<String>,
    pub body: Value,
}

#[derive(Clone, Default)]
struct MockState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    flaky_calls: Arc<AtomicUsize>,
}

/// A fake LLM server. Each model in [`mock_config`] points at one scenario.
pub struct MockUpstream {
    pub base: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockUpstream {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, scenario: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.scenario == scenario)
            .collect()
    }
}

pub async fn spawn_mock_upstream() -> MockUpstream {
    let state = MockState::default();
    let requests = state.requests.clone();

    let app = Router::new()
        .route("/:scenario/chat/completions", post(scenario_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockUpstream {
        base: format!("http://{}", addr),
        requests,
    }
}

fn sse(raw: &str) -> Response {
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        raw.to_string(),
    )
        .into_response()
}

fn raw_sse(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "text/event-stream")], Body::from(body)).into_response()
}

fn sse_record(payload: Value) -> String {
    format!("data: {}\n\n", payload)
}

async fn scenario_handler(
    State(state): State<MockState>,
    Path(scenario): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().unwrap().push(RecordedRequest {
        scenario: scenario.clone(),
        authorization,
        body: body.clone(),
    });

    match scenario.as_str() {
        "sse-ok" => sse(&format!(
            "{}{}data: [DONE]\n\n",
            sse_record(json!({"content": "Hi"})),
            sse_record(json!({"content": " there"}))
        )),
        "openai-chunks" => sse(&format!(
            ": ping\n\n{}{}{}{}data: [DONE]\n\n",
            sse_record(json!({"choices": [{"delta": {"role": "assistant"}}]})),
            sse_record(json!({"choices": [{"delta": {"content": "Hello"}}]})),
            sse_record(json!({"choices": [{"delta": {"content": " world"}, "finish_reason": "stop"}]})),
            sse_record(json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}}))
        )),
        "sse-empty" => sse(""),
        "sse-no-end" => sse(&sse_record(json!({"content": "cut short"}))),
        "sse-malformed" => sse(&format!(
            "data: {{oops\n\n{}data: [DONE]\n\n",
            sse_record(json!({"content": "survived"}))
        )),
        "sse-overlong" => {
            let mut body = sse_record(json!({"content": "Hi"})).into_bytes();
            body.extend_from_slice(b"data: {\"content\": \"");
            body.extend(std::iter::repeat(b'x').take(MAX_LINE_BYTES + 16));
            body.extend_from_slice(b"\"}\n\n");
            body.extend_from_slice(sse_record(json!({"content": " there"})).as_bytes());
            body.extend_from_slice(b"data: [DONE]\n\n");
            raw_sse(body)
        }
        "sse-bad-utf8" => {
            let mut body = sse_record(json!({"content": "Hi"})).into_bytes();
            body.extend_from_slice(b"data: {\"content\": \"\xff\xfe\"}\n\n");
            body.extend_from_slice(sse_record(json!({"content": " there"})).as_bytes());
            body.extend_from_slice(b"data: [DONE]\n\n");
            raw_sse(body)
        }
        "sse-error-after-deltas" => sse(&format!(
            "{}{}",
            sse_record(json!({"content": "Partial"})),
            sse_record(json!({"error": {"message": "model overloaded", "code": 503}}))
        )),
        "ndjson-ok" => (
            [(header::CONTENT_TYPE, "application/x-ndjson")],
            format!(
                "{}\n{}\n{}\n",
                json!({"message": {"role": "assistant", "content": "Hi"}, "done": false}),
                json!({"message": {"role": "assistant", "content": " there"}, "done": false}),
                json!({"message": {"role": "assistant", "content": ""}, "done": true, "done_reason": "stop", "prompt_eval_count": 4, "eval_count": 2})
            ),
        )
            .into_response(),
        "json-ok" => Json(json!({
            "choices": [{"message": {"role": "assistant", "content": "Buffered reply"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        }))
        .into_response(),
        "echo" => {
            let count = body["messages"].as_array().map(|m| m.len()).unwrap_or(0);
            sse(&format!(
                "{}data: [DONE]\n\n",
                sse_record(json!({"content": format!("seen {} messages", count)}))
            ))
        }
        "status-500" => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        "status-401" => (StatusCode::UNAUTHORIZED, "bad key").into_response(),
        "flaky" => {
            if state.flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                (StatusCode::SERVICE_UNAVAILABLE, "warming up").into_response()
            } else {
                sse(&format!(
                    "{}data: [DONE]\n\n",
                    sse_record(json!({"content": "recovered"}))
                ))
            }
        }
        "sse-hang" => {
            let first = sse_record(json!({"content": "Hi"}));
            let stream = futures_util::stream::once(async move {
                Ok::<_, Infallible>(Bytes::from(first))
            })
            .chain(futures_util::stream::pending());
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(stream),
            )
                .into_response()
        }
        other => (StatusCode::NOT_FOUND, format!("unknown scenario {}", other)).into_response(),
    }
}

pub const SCENARIOS: &[&str] = &[
    "sse-ok",
    "openai-chunks",
    "sse-empty",
    "sse-no-end",
    "sse-malformed",
    "sse-overlong",
    "sse-bad-utf8",
    "sse-error-after-deltas",
    "ndjson-ok",
    "json-ok",
    "echo",
    "status-500",
    "status-401",
    "flaky",
    "sse-hang",
];

/// One model per scenario, named after it; `sse-ok` is the default.
pub fn mock_config(base: &str) -> RelayConfig {
    let mut models = serde_json::Map::new();
    for scenario in SCENARIOS {
        let mut entry = json!({
            "model_name": format!("mock-{}", scenario),
            "llm_api_base": format!("{}/{}", base, scenario),
            "llm_api_key": "sk-test-key",
        });
        if *scenario == "ndjson-ok" {
            entry["framing"] = json!("ndjson");
        }
        models.insert(scenario.to_string(), entry);
    }
    RelayConfig::from_json(
        &json!({"default_model": "sse-ok", "llm_models": models}).to_string(),
    )
    .unwrap()
}

pub struct Fixture {
    pub upstream: MockUpstream,
    pub state: Arc<AppState>,
    pub _dir: tempfile::TempDir,
}

pub async fn fixture() -> Fixture {
    fixture_with(|_| {}).await
}

pub async fn fixture_with(tweak: impl FnOnce(&mut Args)) -> Fixture {
    let upstream = spawn_mock_upstream().await;
    let dir = tempfile::tempdir().unwrap();

    let mut args = Args::default();
    args.data_dir = dir.path().to_path_buf();
    args.chunk_timeout_secs = 2;
    tweak(&mut args);

    let registry = ModelRegistry::from_config(&mock_config(&upstream.base)).unwrap();
    let store = SessionStore::open(args.data_dir.clone()).await.unwrap();
    let client = UpstreamClient::new(Duration::from_secs(2), None).unwrap();
    let state = Arc::new(AppState::build(args, registry, store, client));

    Fixture {
        upstream,
        state,
        _dir: dir,
    }
}

pub fn chat(session_id: Option<&str>, model: Option<&str>, message: &str) -> ChatRequest {
    ChatRequest {
        session_id: session_id.map(str::to_string),
        model: model.map(str::to_string),
        message: message.to_string(),
        stream: true,
    }
}

/// Runs a turn to completion and returns everything it emitted.
pub async fn run_turn(state: &AppState, req: ChatRequest) -> (TurnOutcome, Vec<StreamEvent>) {
    let (tx, mut rx) = mpsc::channel(256);
    let outcome = state.relay.handle(req, &tx).await;
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (outcome, events)
}

pub fn deltas(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Delta { content } => Some(content.clone()),
            _ => None,
        })
        .collect()
}

pub fn error_code(events: &[StreamEvent]) -> Option<(u16, String)> {
    events.iter().find_map(|e| match e {
        StreamEvent::Error { status, code, .. } => Some((*status, code.clone())),
        _ => None,
    })
}
