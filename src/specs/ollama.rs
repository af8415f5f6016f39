use super::ProviderErrorBody;
use crate::types::Usage;
use serde::Deserialize;

/// One NDJSON line from Ollama's `/api/chat` (or `/api/generate`), streamed or buffered.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OllamaPayload {
    #[serde(default)]
    pub message: Option<OllamaMessage>,
    /// `/api/generate` puts the fragment here instead of `message`.
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    #[serde(default)]
    pub prompt_eval_count: Option<u32>,
    #[serde(default)]
    pub eval_count: Option<u32>,
    #[serde(default)]
    pub error: Option<ProviderErrorBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OllamaMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl OllamaPayload {
    pub fn text(&self) -> Option<&str> {
        self.message
            .as_ref()
            .and_then(|m| m.content.as_deref())
            .or(self.response.as_deref())
            .or(self.content.as_deref())
    }

    /// Token counts only arrive on the final `done` line.
    pub fn usage(&self) -> Option<Usage> {
        if self.prompt_eval_count.is_none() && self.eval_count.is_none() {
            return None;
        }
        let prompt_tokens = self.prompt_eval_count.unwrap_or_default();
        let completion_tokens = self.eval_count.unwrap_or_default();
        Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        })
    }
}
