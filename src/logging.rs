use crate::constants::{MAX_SESSION_ID_LEN, REQUEST_ID_HEADER};
use crate::framing::Frame;
use crate::redaction_layer::RedactingWriter;
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

const DEFAULT_FILTER: &str = "chat_relay=debug,tower_http=info";
const LOG_FILE_NAME: &str = "chat-relay.log";

/// Installs the global subscriber. Keep the returned guards alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init_tracing(log_dir: &Path, json: bool) -> Vec<WorkerGuard> {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => DEFAULT_FILTER.into(),
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Could not create log dir {}: {}", log_dir.display(), e);
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_writer = move || RedactingWriter::new(non_blocking.clone());

    let (json_layer, text_layer) = if json {
        (
            Some(tracing_subscriber::fmt::layer().json().with_writer(file_writer)),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(|| RedactingWriter::new(std::io::stdout())),
        )
        .with(json_layer)
        .with(text_layer)
        .with(tracing_error::ErrorLayer::default())
        .init();

    vec![guard]
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with an id (the caller's, if it sent a sane one) and
/// runs it inside a `request` span. The id is echoed on the response.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let incoming = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_SESSION_ID_LEN);
    let request_id = match incoming {
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };

    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;

    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Per-stream counters, logged once when the stream terminates.
pub struct StreamMetric {
    pub framing: &'static str,
    pub lines: usize,
    pub records: usize,
    pub deltas: usize,
    pub malformed: usize,
    pub text_chars: usize,
    started: Instant,
}

impl StreamMetric {
    pub fn new(framing: &'static str) -> Self {
        Self {
            framing,
            lines: 0,
            records: 0,
            deltas: 0,
            malformed: 0,
            text_chars: 0,
            started: Instant::now(),
        }
    }

    pub fn record_frame(&mut self, frame: &Frame) {
        self.records += 1;
        if matches!(frame, Frame::Malformed(_)) {
            self.malformed += 1;
        }
    }

    pub fn record_delta(&mut self, text: &str) {
        self.deltas += 1;
        self.text_chars += text.chars().count();
    }

    pub fn log_summary(&self, outcome: &str) {
        info!(
            target: "flight_recorder",
            "[STREAM END] Outcome: {} | Framing: {} | Lines: {} | Records: {} | Deltas: {} | Malformed: {} | Text: {} chars | Elapsed: {:?}",
            outcome,
            self.framing,
            self.lines,
            self.records,
            self.deltas,
            self.malformed,
            self.text_chars,
            self.started.elapsed()
        );
    }
}
