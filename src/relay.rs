use crate::hardening::RetryPolicy;
use crate::registry::{ModelRegistry, ModelTarget};
use crate::store::SessionStore;
use crate::streaming::{Completion, NormalizedEvent, StreamNormalizer};
use crate::types::*;
use crate::upstream::{LineStream, UpstreamClient, UpstreamResponse};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub message: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

#[derive(Debug)]
pub enum TurnOutcome {
    Completed(Message),
    Failed(ObservedError),
    Cancelled,
}

enum StreamResult {
    Completed(Completion),
    Failed(RelayError),
    Cancelled,
}

/// Runs one chat turn end to end: session, upstream, normalization, persistence.
pub struct CompletionRelay {
    store: Arc<SessionStore>,
    registry: Arc<ModelRegistry>,
    upstream: UpstreamClient,
    retry: RetryPolicy,
    chunk_timeout: Duration,
    health: Arc<UpstreamHealth>,
}

impl CompletionRelay {
    pub fn new(
        store: Arc<SessionStore>,
        registry: Arc<ModelRegistry>,
        upstream: UpstreamClient,
        health: Arc<UpstreamHealth>,
    ) -> Self {
        Self {
            store,
            registry,
            upstream,
            retry: RetryPolicy::default(),
            chunk_timeout: Duration::from_secs(120),
            health,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_timeout(mut self, chunk_timeout: Duration) -> Self {
        self.chunk_timeout = chunk_timeout;
        self
    }

    /// Every event of the turn goes to `sink`; at most one of them is terminal.
    pub async fn handle(&self, req: ChatRequest, sink: &mpsc::Sender<StreamEvent>) -> TurnOutcome {
        if req.message.trim().is_empty() {
            return Self::fail(
                sink,
                RelayError::InvalidRequest("message must not be empty".into()).into(),
            )
            .await;
        }

        let requested = req.session_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let session_id = match requested {
            Some(id) => match self.store.get(id).await {
                Ok(session) => session.id,
                Err(e) => return Self::fail(sink, e).await,
            },
            None => match self.store.create().await {
                Ok(id) => {
                    let announced = emit(
                        sink,
                        StreamEvent::Session {
                            session_id: id.clone(),
                        },
                    )
                    .await;
                    if !announced {
                        return TurnOutcome::Cancelled;
                    }
                    id
                }
                Err(e) => return Self::fail(sink, e).await,
            },
        };

        let target = self.registry.resolve_or_default(req.model.as_deref());

        let user_message = Message::user(req.message);
        let session = match self
            .store
            .append(session_id.as_str(), user_message.clone())
            .await
        {
            Ok(s) => s,
            Err(e) => return Self::fail(sink, e).await,
        };
        let history = &session.messages[..session.messages.len().saturating_sub(1)];

        tracing::info!(
            "[🖥️  -> ⚙️ ] Turn for session {} via '{}' ({} prior messages, stream={})",
            session_id.short(),
            target.name,
            history.len(),
            req.stream
        );

        let target_ref: &ModelTarget = &target;
        let message_ref = &user_message;
        let upstream = &self.upstream;
        let streaming = req.stream;
        let opened = tokio::select! {
            biased;
            _ = sink.closed() => {
                tracing::warn!("[⚙️  -> 🖥️ ] Client disconnected before upstream responded");
                return TurnOutcome::Cancelled;
            }
            result = self.retry.execute_with_retry(move || {
                upstream.invoke(target_ref, history, message_ref, streaming)
            }) => result,
        };

        let response = match opened {
            Ok(r) => r,
            Err(e) => {
                self.health.record_failure();
                return Self::fail(sink, e).await;
            }
        };

        let completion = match response {
            UpstreamResponse::Complete(completion) => completion,
            UpstreamResponse::Streaming(lines) => {
                let stream_span = tracing::info_span!(
                    "stream",
                    sid = %session_id.short(),
                    model = %target.name,
                    stream_id = %uuid::Uuid::new_v4()
                );
                match self
                    .drive_stream(lines, target_ref, sink)
                    .instrument(stream_span)
                    .await
                {
                    StreamResult::Completed(completion) => completion,
                    StreamResult::Failed(err) => {
                        self.health.record_failure();
                        return Self::fail(sink, err.into()).await;
                    }
                    StreamResult::Cancelled => return TurnOutcome::Cancelled,
                }
            }
        };
        self.health.record_success();

        let assistant = Message::assistant(completion.content);
        if let Err(e) = self
            .store
            .append(session_id.as_str(), assistant.clone())
            .await
        {
            return Self::fail(sink, e).await;
        }

        let done = StreamEvent::Done {
            message: assistant.clone(),
            meta: CompletionMeta {
                session_id,
                model: target.name.clone(),
                finish_reason: completion.finish_reason,
                usage: completion.usage,
                deltas: completion.deltas,
            },
        };
        if !emit(sink, done).await {
            tracing::debug!("[⚙️  -> 🖥️ ] Client left after the reply was stored");
        }
        TurnOutcome::Completed(assistant)
    }

    async fn drive_stream(
        &self,
        mut lines: LineStream,
        target: &ModelTarget,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> StreamResult {
        let mut normalizer = StreamNormalizer::new(target.framing);

        loop {
            let next = tokio::select! {
                biased;
                _ = sink.closed() => {
                    tracing::warn!("[⚙️  -> 🖥️ ] Client disconnected; dropping upstream stream");
                    return StreamResult::Cancelled;
                }
                next = tokio::time::timeout(self.chunk_timeout, lines.next()) => next,
            };

            let events = match next {
                Err(_) => {
                    tracing::error!(
                        "[☁️  -> ⚙️ ] No upstream data for {:?}",
                        self.chunk_timeout
                    );
                    normalizer
                        .abort(RelayError::UpstreamTimeout(format!(
                            "no data from upstream for {:?}",
                            self.chunk_timeout
                        )))
                        .into_iter()
                        .collect()
                }
                Ok(Some(Ok(line))) => normalizer.push(line),
                Ok(Some(Err(e))) => normalizer.read_error(e),
                Ok(None) => normalizer.finish(),
            };

            for event in events {
                match event {
                    NormalizedEvent::Delta(content) => {
                        if !emit(sink, StreamEvent::Delta { content }).await {
                            return StreamResult::Cancelled;
                        }
                    }
                    NormalizedEvent::Completed(completion) => {
                        return StreamResult::Completed(completion)
                    }
                    NormalizedEvent::Failed(err) => return StreamResult::Failed(err),
                }
            }

            if normalizer.is_terminated() {
                return StreamResult::Failed(RelayError::Internal(
                    "stream terminated without an outcome".into(),
                ));
            }
        }
    }

    async fn fail(sink: &mpsc::Sender<StreamEvent>, err: ObservedError) -> TurnOutcome {
        match &err.inner {
            RelayError::SessionNotFound(_) | RelayError::InvalidRequest(_) => {
                tracing::warn!("[⚙️ ] Turn rejected: {}", err.inner)
            }
            _ => tracing::error!("[⚙️ ] Turn failed: {}", err),
        }
        emit(sink, StreamEvent::from_error(&err.inner)).await;
        TurnOutcome::Failed(err)
    }
}

/// False once the client has gone away.
async fn emit(sink: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    let kind = event.kind();
    match sink.send(event).await {
        Ok(()) => true,
        Err(_) => {
            tracing::trace!("Client disconnected, dropping {} event", kind);
            false
        }
    }
}
