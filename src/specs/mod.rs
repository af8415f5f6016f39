//! Upstream wire schemas, one module per provider family.

pub mod ollama;
pub mod openai;

use axum::http::StatusCode;
use serde::Deserialize;

/// `{"error": ...}` as sent by OpenAI-compatible servers (object) or Ollama (string).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ProviderErrorBody {
    Detailed {
        #[serde(default)]
        message: String,
        #[serde(default)]
        code: Option<serde_json::Value>,
    },
    Plain(String),
}

impl ProviderErrorBody {
    pub fn message(&self) -> &str {
        match self {
            ProviderErrorBody::Detailed { message, .. } if !message.is_empty() => message,
            ProviderErrorBody::Detailed { .. } => "upstream reported an error",
            ProviderErrorBody::Plain(m) => m,
        }
    }

    /// The error's own status when it carries a usable HTTP error code, else 502.
    pub fn status(&self) -> StatusCode {
        let code = match self {
            ProviderErrorBody::Detailed {
                code: Some(serde_json::Value::Number(n)),
                ..
            } => n.as_u64(),
            ProviderErrorBody::Detailed {
                code: Some(serde_json::Value::String(s)),
                ..
            } => s.parse::<u64>().ok(),
            _ => None,
        };
        match code
            .filter(|c| (400..600).contains(c))
            .and_then(|c| StatusCode::from_u16(c as u16).ok())
        {
            Some(status) => status,
            None => StatusCode::BAD_GATEWAY,
        }
    }
}
