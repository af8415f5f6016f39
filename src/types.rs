use crate::constants::{MAX_SESSION_ID_LEN, TITLE_MAX_CHARS};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// Opaque session identifier. Restricted to characters that are safe as a file stem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_SESSION_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: None,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Appends a message, deriving the title from the first user turn.
    pub fn push(&mut self, message: Message) {
        if self.title.is_none() && message.role == Role::User {
            self.title = derive_title(&message.content);
        }
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            title: self.title.clone(),
            updated_at: self.updated_at,
            message_count: self.messages.len(),
        }
    }
}

fn derive_title(content: &str) -> Option<String> {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    let title = crate::str_utils::prefix_chars(&collapsed, TITLE_MAX_CHARS);
    if title.len() < collapsed.len() {
        Some(format!("{}…", title))
    } else {
        Some(title.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionMeta {
    pub session_id: SessionId,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub deltas: usize,
}

/// --- CLIENT WIRE EVENTS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Session {
        session_id: SessionId,
    },
    Delta {
        content: String,
    },
    Done {
        message: Message,
        meta: CompletionMeta,
    },
    Error {
        status: u16,
        code: String,
        message: String,
    },
}

impl StreamEvent {
    pub fn from_error(err: &RelayError) -> Self {
        StreamEvent::Error {
            status: err.status().as_u16(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Session { .. } => "session",
            StreamEvent::Delta { .. } => "delta",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}

#[derive(Default)]
pub struct UpstreamHealth {
    pub consecutive_failures: AtomicU32,
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl UpstreamHealth {
    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "consecutive_failures": self.consecutive_failures.load(Ordering::Relaxed),
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "failed_requests": self.failed_requests.load(Ordering::Relaxed),
        })
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream error (status {0}): {1}")]
    UpstreamHttp(StatusCode, String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Malformed upstream frame: {0}")]
    MalformedFrame(String),

    #[error("Client disconnected")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RelayError::UpstreamTimeout(e.to_string())
        } else if let Some(status) = e.status() {
            RelayError::UpstreamHttp(status, e.to_string())
        } else {
            RelayError::UpstreamUnreachable(e.to_string())
        }
    }
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::UnknownModel(_) | RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::UpstreamUnreachable(_) | RelayError::MalformedFrame(_) => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::UpstreamHttp(status, _) => *status,
            RelayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Cancelled => match StatusCode::from_u16(499) {
                Ok(s) => s,
                Err(_) => StatusCode::BAD_REQUEST,
            },
            RelayError::Storage(_)
            | RelayError::Serialization(_)
            | RelayError::Config(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::UnknownModel(_) => "UNKNOWN_MODEL",
            RelayError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            RelayError::Storage(_) => "STORAGE_ERROR",
            RelayError::Serialization(_) => "SERIALIZATION_ERROR",
            RelayError::UpstreamUnreachable(_) => "UPSTREAM_UNREACHABLE",
            RelayError::UpstreamHttp(_, _) => "UPSTREAM_HTTP_ERROR",
            RelayError::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            RelayError::MalformedFrame(_) => "MALFORMED_UPSTREAM_FRAME",
            RelayError::Cancelled => "CANCELLED",
            RelayError::InvalidRequest(_) => "INVALID_REQUEST",
            RelayError::Config(_) => "CONFIG_ERROR",
            RelayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        (
            self.inner.status(),
            axum::Json(serde_json::json!({
                "error": self.inner.to_string(),
                "code": self.inner.code(),
                "span_trace": self.span_trace.to_string(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
