use super::ProviderErrorBody;
use crate::types::{Message, Usage};
use serde::{Deserialize, Serialize};

/// --- OPENAI-COMPATIBLE REQUEST ---
///
/// Ollama's `/api/chat` accepts the same shape, so every target gets this body.

#[derive(Debug, Clone, Serialize)]
pub struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    pub stream: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenAiMessage {
    pub role: String,
    pub content: String,
}

impl From<&Message> for OpenAiMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        }
    }
}

/// --- RESPONSE / STREAM CHUNK ---
///
/// One struct covers both the streamed `chat.completion.chunk` and the buffered
/// `chat.completion`: chunks fill `delta`, completions fill `message`, legacy
/// completions fill `text`. Minimal relays send a bare top-level `content`.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiPayload {
    #[serde(default)]
    pub choices: Vec<OpenAiChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<ProviderErrorBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiChoice {
    #[serde(default)]
    pub delta: Option<OpenAiContent>,
    #[serde(default)]
    pub message: Option<OpenAiContent>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAiContent {
    #[serde(default)]
    pub content: Option<String>,
}

impl OpenAiPayload {
    pub fn text(&self) -> Option<&str> {
        let from_choice = self.choices.first().and_then(|choice| {
            choice
                .delta
                .as_ref()
                .and_then(|d| d.content.as_deref())
                .or_else(|| choice.message.as_ref().and_then(|m| m.content.as_deref()))
                .or(choice.text.as_deref())
        });
        from_choice.or(self.content.as_deref())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.finish_reason.as_deref())
    }
}
