use crate::constants::MAX_LINE_BYTES;
use crate::framing::Frame;
use crate::registry::ModelTarget;
use crate::specs::openai::{OpenAiMessage, OpenAiRequest};
use crate::streaming::Completion;
use crate::str_utils::snippet;
use crate::types::{Message, RelayError, Result};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::codec::{Decoder, FramedRead};

/// One line of an upstream body, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamLine {
    Text(String),
    /// Over-long or not UTF-8. The line is gone but the stream goes on.
    Malformed(String),
}

/// Upstream body split into lines. Lazy, finite, not restartable.
/// An `Err` is a transport failure and ends the stream.
pub type LineStream =
    Pin<Box<dyn Stream<Item = std::result::Result<UpstreamLine, std::io::Error>> + Send>>;

/// Newline splitter that reports a bad line as an item instead of an error,
/// so one bad line never poisons the reader behind it.
#[derive(Debug)]
pub struct UpstreamLineCodec {
    max_length: usize,
    /// Bytes of `buf` already searched for `\n`.
    next_index: usize,
    /// Inside an over-long line; drop bytes until its newline.
    discarding: bool,
}

impl UpstreamLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn too_long(&self) -> UpstreamLine {
        UpstreamLine::Malformed(format!("line exceeded {} bytes", self.max_length))
    }

    fn finish_line(&self, raw: &[u8]) -> UpstreamLine {
        let raw = match raw.strip_suffix(b"\r") {
            Some(r) => r,
            None => raw,
        };
        if raw.len() > self.max_length {
            return self.too_long();
        }
        match std::str::from_utf8(raw) {
            Ok(text) => UpstreamLine::Text(text.to_string()),
            Err(e) => UpstreamLine::Malformed(format!(
                "invalid UTF-8 ({}) in {}",
                e,
                snippet(&String::from_utf8_lossy(raw), 120)
            )),
        }
    }
}

impl Decoder for UpstreamLineCodec {
    type Item = UpstreamLine;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<UpstreamLine>> {
        let newline = buf[self.next_index..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| self.next_index + offset);

        match newline {
            Some(pos) => {
                self.next_index = 0;
                let line = buf.split_to(pos + 1);
                if self.discarding {
                    self.discarding = false;
                    return Ok(Some(self.too_long()));
                }
                Ok(Some(self.finish_line(&line[..pos])))
            }
            None if self.discarding || buf.len() > self.max_length => {
                self.discarding = true;
                self.next_index = 0;
                buf.advance(buf.len());
                Ok(None)
            }
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<UpstreamLine>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(Some(self.too_long()));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(Some(self.finish_line(&line)))
    }
}

pub enum UpstreamResponse {
    Complete(Completion),
    Streaming(LineStream),
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamResponse::Complete(c) => f.debug_tuple("Complete").field(c).finish(),
            UpstreamResponse::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// Issues completion requests. Never retries; callers own the retry policy.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(connect_timeout: Duration, request_timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)));
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }

        match builder.build() {
            Ok(http) => Ok(Self { http }),
            Err(e) => Err(RelayError::Config(format!("failed to build HTTP client: {}", e)).into()),
        }
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn build_request(
        target: &ModelTarget,
        history: &[Message],
        new_user_message: &Message,
        streaming: bool,
    ) -> OpenAiRequest {
        let mut messages: Vec<OpenAiMessage> = history.iter().map(OpenAiMessage::from).collect();
        messages.push(OpenAiMessage::from(new_user_message));

        OpenAiRequest {
            model: target.model_name.clone(),
            messages,
            stream: streaming,
            extra: target.options.clone(),
        }
    }

    pub async fn invoke(
        &self,
        target: &ModelTarget,
        history: &[Message],
        new_user_message: &Message,
        streaming: bool,
    ) -> Result<UpstreamResponse> {
        let request = Self::build_request(target, history, new_user_message, streaming);
        tracing::info!(
            "[⚙️  -> ☁️ ] {} -> {} ({} messages, stream={})",
            target.name,
            target.url,
            request.messages.len(),
            streaming
        );

        let response = self.send(target, &request).await?;

        if streaming {
            return Ok(UpstreamResponse::Streaming(Self::line_stream(response)));
        }

        let body = response.text().await?;
        match target.framing.decode_body(&body) {
            Frame::Chunk(chunk) => Ok(UpstreamResponse::Complete(Completion {
                content: match chunk.text {
                    Some(t) => t,
                    None => String::new(),
                },
                finish_reason: chunk.finish_reason,
                usage: chunk.usage,
                deltas: 0,
            })),
            Frame::End => Ok(UpstreamResponse::Complete(Completion::default())),
            Frame::ProviderError { status, message } => {
                Err(RelayError::UpstreamHttp(status, message).into())
            }
            Frame::Malformed(reason) => Err(RelayError::MalformedFrame(reason).into()),
        }
    }

    /// Sends a caller-built OpenAI body to `target` and hands back the upstream JSON as is.
    pub async fn forward_raw(
        &self,
        target: &ModelTarget,
        mut body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let object = match body.as_object_mut() {
            Some(o) => o,
            None => {
                return Err(
                    RelayError::InvalidRequest("request body must be a JSON object".into()).into(),
                )
            }
        };
        object.insert("model".into(), target.model_name.clone().into());
        object.insert("stream".into(), false.into());
        for (key, value) in &target.options {
            object.entry(key.clone()).or_insert_with(|| value.clone());
        }

        tracing::info!("[⚙️  -> ☁️ ] Passthrough -> {} ({})", target.name, target.url);
        let response = self.send(target, &body).await?;
        let text = response.text().await?;
        match serde_json::from_str(&text) {
            Ok(v) => Ok(v),
            Err(e) => Err(RelayError::MalformedFrame(format!(
                "{} in {}",
                e,
                snippet(&text, 120)
            ))
            .into()),
        }
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        target: &ModelTarget,
        body: &B,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.post(target.url.clone()).json(body);
        if let Some(key) = &target.credential {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);

        if status.is_success() {
            return Ok(response);
        }

        let error_body = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to read error body: {}", e);
                format!("Upstream error (body unreadable): {}", e)
            }
        };
        tracing::error!("[☁️  -> ⚙️ ] Upstream Error: {}", snippet(&error_body, 500));
        Err(RelayError::UpstreamHttp(status, snippet(&error_body, 2000).into_owned()).into())
    }

    fn line_stream(response: reqwest::Response) -> LineStream {
        let bytes_stream = response.bytes_stream().map(|r| {
            r.map_err(|e| {
                if e.is_timeout() {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, e)
                } else {
                    std::io::Error::other(e)
                }
            })
        });
        lines_from_bytes(bytes_stream)
    }
}

/// Splits a raw body into lines, however its chunks happen to be cut.
pub fn lines_from_bytes<S>(bytes_stream: S) -> LineStream
where
    S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
{
    Box::pin(FramedRead::new(
        tokio_util::io::StreamReader::new(bytes_stream),
        UpstreamLineCodec::new(MAX_LINE_BYTES),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::registry::ModelRegistry;

    fn target() -> std::sync::Arc<ModelTarget> {
        let config = RelayConfig::from_json(
            r#"{"llm_models": {"local": {
                "model_name": "qwen",
                "llm_api_base": "http://127.0.0.1:1234/v1",
                "llm_options": {"temperature": 0.2, "stream": false}
            }}}"#,
        )
        .unwrap();
        ModelRegistry::from_config(&config).unwrap().default_target()
    }

    #[test]
    fn request_carries_history_then_new_turn() {
        let target = target();
        let history = vec![Message::user("hello"), Message::assistant("Hi there")];
        let request =
            UpstreamClient::build_request(&target, &history, &Message::user("again"), true);

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "qwen");
        assert_eq!(value["stream"], true);
        assert_eq!(value["temperature"], 0.2);
        let roles: Vec<&str> = value["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(value["messages"][2]["content"], "again");
        assert_eq!(
            target.url.as_str(),
            "http://127.0.0.1:1234/v1/chat/completions"
        );
    }

    async fn collect_lines(chunks: Vec<Bytes>) -> Vec<UpstreamLine> {
        let stream = futures_util::stream::iter(chunks.into_iter().map(Ok));
        lines_from_bytes(stream).map(|l| l.unwrap()).collect().await
    }

    fn text(s: &str) -> UpstreamLine {
        UpstreamLine::Text(s.to_string())
    }

    #[tokio::test]
    async fn lines_survive_arbitrary_chunk_boundaries() {
        let lines = collect_lines(vec![
            Bytes::from_static(b"data: {\"con"),
            Bytes::from_static(b"tent\":\"Hi\"}\r\n\r"),
            Bytes::from_static(b"\ndata: [DONE]"),
        ])
        .await;
        assert_eq!(
            lines,
            vec![text("data: {\"content\":\"Hi\"}"), text(""), text("data: [DONE]")]
        );
    }

    #[tokio::test]
    async fn overlong_line_is_dropped_and_reading_continues() {
        let mut long = b"data: {\"content\":\"".to_vec();
        long.extend(std::iter::repeat(b'x').take(MAX_LINE_BYTES + 10));
        // Split the long line across chunks so the reader must discard mid-line.
        let (head, tail) = long.split_at(MAX_LINE_BYTES / 2);

        let lines = collect_lines(vec![
            Bytes::from_static(b"data: a\n"),
            Bytes::copy_from_slice(head),
            Bytes::copy_from_slice(tail),
            Bytes::from_static(b"\"}\ndata: b\n"),
        ])
        .await;

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], text("data: a"));
        assert!(matches!(&lines[1], UpstreamLine::Malformed(r) if r.contains("exceeded")));
        assert_eq!(lines[2], text("data: b"));
    }

    #[tokio::test]
    async fn overlong_line_in_one_chunk_is_dropped() {
        let mut body = b"data: a\n".to_vec();
        body.extend(std::iter::repeat(b'y').take(MAX_LINE_BYTES + 1));
        body.extend_from_slice(b"\ndata: b\n");

        let lines = collect_lines(vec![Bytes::from(body)]).await;
        assert_eq!(lines.len(), 3);
        assert!(matches!(lines[1], UpstreamLine::Malformed(_)));
        assert_eq!(lines[2], text("data: b"));
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_malformed_not_fatal() {
        let lines = collect_lines(vec![
            Bytes::from_static(b"data: a\n"),
            Bytes::from_static(b"data: {\"content\":\"\xff\xfe\"}\n"),
            Bytes::from_static(b"data: b\n"),
        ])
        .await;

        assert_eq!(lines.len(), 3);
        assert!(matches!(&lines[1], UpstreamLine::Malformed(r) if r.contains("UTF-8")));
        assert_eq!(lines[2], text("data: b"));
    }

    #[tokio::test]
    async fn transport_error_is_surfaced() {
        let chunks = vec![
            Ok(Bytes::from_static(b"data: a\n")),
            Err(std::io::Error::other("connection reset")),
        ];
        let items: Vec<_> = lines_from_bytes(futures_util::stream::iter(chunks))
            .collect()
            .await;
        assert!(matches!(&items[0], Ok(UpstreamLine::Text(t)) if t == "data: a"));
        assert!(matches!(&items[1], Err(e) if e.to_string().contains("reset")));
    }
}
