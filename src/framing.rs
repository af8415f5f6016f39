//! Upstream framing conventions.
//!
//! Each upstream streams its reply in one of a few wire conventions. A
//! [`FrameDecoder`] turns the upstream's lines into [`Frame`]s; the
//! normalizer in `streaming.rs` never looks at vendor field names.

use crate::constants::SSE_DONE_MARKER;
use crate::specs::ollama::OllamaPayload;
use crate::specs::openai::OpenAiPayload;
use crate::str_utils::snippet;
use crate::types::Usage;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// `data: {json}` records separated by blank lines, ended by `data: [DONE]`.
    #[default]
    Sse,
    /// One JSON object per line, ended by `"done": true`.
    Ndjson,
}

impl Framing {
    pub fn decoder(self) -> Box<dyn FrameDecoder> {
        match self {
            Framing::Sse => Box::new(SseDecoder::default()),
            Framing::Ndjson => Box::new(NdjsonDecoder),
        }
    }

    /// Interprets a buffered (non-streaming) response body.
    pub fn decode_body(self, body: &str) -> Frame {
        match self {
            Framing::Sse => openai_frame(body.trim()),
            Framing::Ndjson => ollama_frame(body.trim()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkFrame {
    pub text: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    /// The upstream marked this chunk as its last.
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Chunk(ChunkFrame),
    End,
    ProviderError { status: StatusCode, message: String },
    Malformed(String),
}

pub trait FrameDecoder: Send {
    fn name(&self) -> &'static str;

    /// Feeds one upstream line, without its line terminator.
    fn push_line(&mut self, line: &str) -> Option<Frame>;

    /// Reports a line the reader had to drop (over-long, not UTF-8).
    fn reject_line(&mut self, reason: &str) -> Option<Frame> {
        Some(Frame::Malformed(reason.to_string()))
    }

    /// Flushes a partially assembled record once the upstream has closed.
    fn finish(&mut self) -> Option<Frame>;
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    data_lines: Vec<String>,
    /// The current record lost a line; drop the whole record.
    poisoned: bool,
}

impl SseDecoder {
    fn dispatch(&mut self) -> Option<Frame> {
        if self.poisoned {
            self.poisoned = false;
            self.data_lines.clear();
            return None;
        }
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();

        if payload.trim() == SSE_DONE_MARKER {
            tracing::debug!("[☁️  -> ⚙️ ] Stream end marker {} received", SSE_DONE_MARKER);
            return Some(Frame::End);
        }
        Some(openai_frame(&payload))
    }
}

impl FrameDecoder for SseDecoder {
    fn name(&self) -> &'static str {
        "sse"
    }

    fn push_line(&mut self, line: &str) -> Option<Frame> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data_lines.push(value.to_string());
            return None;
        }
        if line == "data" {
            self.data_lines.push(String::new());
            return None;
        }

        let field = match line.split_once(':') {
            Some((name, _)) => name,
            None => line,
        };
        if matches!(field, "event" | "id" | "retry") {
            return None;
        }

        Some(Frame::Malformed(format!(
            "not an SSE field: {}",
            snippet(line, 120)
        )))
    }

    fn reject_line(&mut self, reason: &str) -> Option<Frame> {
        self.poisoned = true;
        Some(Frame::Malformed(reason.to_string()))
    }

    fn finish(&mut self) -> Option<Frame> {
        self.dispatch()
    }
}

#[derive(Debug, Default)]
pub struct NdjsonDecoder;

impl FrameDecoder for NdjsonDecoder {
    fn name(&self) -> &'static str {
        "ndjson"
    }

    fn push_line(&mut self, line: &str) -> Option<Frame> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(ollama_frame(line))
    }

    fn finish(&mut self) -> Option<Frame> {
        None
    }
}

fn openai_frame(payload: &str) -> Frame {
    let parsed: OpenAiPayload = match serde_json::from_str(payload) {
        Ok(p) => p,
        Err(e) => return Frame::Malformed(format!("{} in {}", e, snippet(payload, 120))),
    };
    if let Some(err) = &parsed.error {
        return Frame::ProviderError {
            status: err.status(),
            message: err.message().to_string(),
        };
    }
    Frame::Chunk(ChunkFrame {
        text: parsed.text().map(str::to_string),
        finish_reason: parsed.finish_reason().map(str::to_string),
        usage: parsed.usage,
        done: false,
    })
}

fn ollama_frame(line: &str) -> Frame {
    let parsed: OllamaPayload = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(e) => return Frame::Malformed(format!("{} in {}", e, snippet(line, 120))),
    };
    if let Some(err) = &parsed.error {
        return Frame::ProviderError {
            status: err.status(),
            message: err.message().to_string(),
        };
    }
    Frame::Chunk(ChunkFrame {
        text: parsed.text().map(str::to_string),
        finish_reason: parsed.done_reason.clone(),
        usage: parsed.usage(),
        done: parsed.done,
    })
}
