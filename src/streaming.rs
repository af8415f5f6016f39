use crate::constants::MAX_STREAM_LINES;
use crate::framing::{ChunkFrame, Frame, FrameDecoder, Framing};
use crate::logging::StreamMetric;
use crate::types::{RelayError, Usage};
use crate::upstream::UpstreamLine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    AwaitingFirstChunk,
    Streaming,
    Terminated(StreamOutcome),
}

/// A finished assistant reply, streamed or buffered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub deltas: usize,
}

#[derive(Debug)]
pub enum NormalizedEvent {
    Delta(String),
    Completed(Completion),
    Failed(RelayError),
}

impl NormalizedEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NormalizedEvent::Delta(_))
    }
}

/// Turns one upstream line stream into deltas plus exactly one terminal event.
///
/// Fed line by line; everything after the terminal event is ignored.
pub struct StreamNormalizer {
    decoder: Box<dyn FrameDecoder>,
    state: StreamState,
    buffer: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    deltas: usize,
    metrics: StreamMetric,
}

impl StreamNormalizer {
    pub fn new(framing: Framing) -> Self {
        Self::with_decoder(framing.decoder())
    }

    pub fn with_decoder(decoder: Box<dyn FrameDecoder>) -> Self {
        let metrics = StreamMetric::new(decoder.name());
        Self {
            decoder,
            state: StreamState::AwaitingFirstChunk,
            buffer: String::new(),
            finish_reason: None,
            usage: None,
            deltas: 0,
            metrics,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, StreamState::Terminated(_))
    }

    pub fn push(&mut self, line: UpstreamLine) -> Vec<NormalizedEvent> {
        match line {
            UpstreamLine::Text(text) => self.push_line(&text),
            UpstreamLine::Malformed(reason) => self.push_malformed(&reason),
        }
    }

    pub fn push_line(&mut self, line: &str) -> Vec<NormalizedEvent> {
        if let Some(events) = self.count_line() {
            return events;
        }
        match self.decoder.push_line(line) {
            Some(frame) => self.apply(frame),
            None => Vec::new(),
        }
    }

    /// A line the reader could not deliver. Only that line is lost.
    pub fn push_malformed(&mut self, reason: &str) -> Vec<NormalizedEvent> {
        if let Some(events) = self.count_line() {
            return events;
        }
        match self.decoder.reject_line(reason) {
            Some(frame) => self.apply(frame),
            None => Vec::new(),
        }
    }

    /// `Some` when the line must not reach the decoder.
    fn count_line(&mut self) -> Option<Vec<NormalizedEvent>> {
        if self.is_terminated() {
            tracing::trace!("[☁️  -> ⚙️ ] Ignoring line after termination");
            return Some(Vec::new());
        }

        self.metrics.lines += 1;
        if self.metrics.lines > MAX_STREAM_LINES {
            tracing::error!(
                "[☁️  -> ⚙️ ] Stream exceeded max line limit ({})",
                MAX_STREAM_LINES
            );
            return Some(vec![self.fail(RelayError::Internal(
                "Stream exceeded max line limit".to_string(),
            ))]);
        }
        None
    }

    /// The upstream closed its body.
    pub fn finish(&mut self) -> Vec<NormalizedEvent> {
        if self.is_terminated() {
            return Vec::new();
        }

        let mut events = match self.decoder.finish() {
            Some(frame) => self.apply(frame),
            None => Vec::new(),
        };
        if self.is_terminated() {
            return events;
        }

        if self.deltas > 0 {
            tracing::info!(
                "[☁️  -> ⚙️ ] Upstream closed without end marker after {} deltas; accepting reply",
                self.deltas
            );
            events.push(self.complete());
        } else {
            events.push(self.fail(RelayError::UpstreamTimeout(
                "upstream closed the stream without sending any content".to_string(),
            )));
        }
        events
    }

    /// Maps a transport failure under the line reader. Always terminal.
    pub fn read_error(&mut self, io: std::io::Error) -> Vec<NormalizedEvent> {
        if self.is_terminated() {
            return Vec::new();
        }
        tracing::error!("[☁️  -> ⚙️ ] Line Read Error: {}", io);
        let err = if io.kind() == std::io::ErrorKind::TimedOut {
            RelayError::UpstreamTimeout(io.to_string())
        } else {
            RelayError::UpstreamUnreachable(io.to_string())
        };
        vec![self.fail(err)]
    }

    /// Terminates with an error raised outside the line stream (chunk timeout).
    pub fn abort(&mut self, err: RelayError) -> Option<NormalizedEvent> {
        if self.is_terminated() {
            return None;
        }
        Some(self.fail(err))
    }

    fn apply(&mut self, frame: Frame) -> Vec<NormalizedEvent> {
        self.metrics.record_frame(&frame);
        match frame {
            Frame::Chunk(chunk) => self.apply_chunk(chunk),
            Frame::End => vec![self.complete()],
            Frame::ProviderError { status, message } => {
                tracing::error!(
                    "[☁️  -> ⚙️ ] Provider error frame (status {}): {}",
                    status,
                    message
                );
                vec![self.fail(RelayError::UpstreamHttp(status, message))]
            }
            Frame::Malformed(reason) => {
                tracing::warn!("[☁️  -> ⚙️ ] Skipping malformed frame: {}", reason);
                Vec::new()
            }
        }
    }

    fn apply_chunk(&mut self, chunk: ChunkFrame) -> Vec<NormalizedEvent> {
        let mut events = Vec::new();

        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        if let Some(text) = chunk.text.filter(|t| !t.is_empty()) {
            if self.state == StreamState::AwaitingFirstChunk {
                tracing::debug!("[☁️  -> ⚙️ ] First content chunk received");
                self.state = StreamState::Streaming;
            }
            self.deltas += 1;
            self.metrics.record_delta(&text);
            self.buffer.push_str(&text);
            events.push(NormalizedEvent::Delta(text));
        }

        if chunk.done {
            events.push(self.complete());
        }
        events
    }

    fn complete(&mut self) -> NormalizedEvent {
        self.state = StreamState::Terminated(StreamOutcome::Success);
        self.metrics.log_summary("success");
        NormalizedEvent::Completed(Completion {
            content: std::mem::take(&mut self.buffer),
            finish_reason: self.finish_reason.take(),
            usage: self.usage.take(),
            deltas: self.deltas,
        })
    }

    fn fail(&mut self, err: RelayError) -> NormalizedEvent {
        self.state = StreamState::Terminated(StreamOutcome::Failure);
        self.metrics.log_summary("failure");
        self.buffer.clear();
        NormalizedEvent::Failed(err)
    }
}
