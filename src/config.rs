//! Model configuration file.
//!
//! The relay reads a JSON document mapping model names to upstream endpoints:
//!
//! ```json
//! {
//!   "default_model": "local",
//!   "llm_models": {
//!     "local": {
//!       "model_name": "qwen2.5-7b-instruct",
//!       "llm_api_url": "http://127.0.0.1:1234/v1/chat/completions",
//!       "llm_api_key_env": "LOCAL_LLM_KEY",
//!       "framing": "sse",
//!       "llm_options": { "temperature": 0.7 }
//!     }
//!   }
//! }
//! ```
//!
//! Anything wrong in this file is fatal at startup; the registry built from it
//! never changes afterwards.

use crate::constants::CHAT_COMPLETIONS_PATH;
use crate::framing::Framing;
use crate::types::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub llm_models: BTreeMap<String, ModelEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Model id sent upstream. Defaults to the entry key.
    #[serde(default)]
    pub model_name: Option<String>,
    /// Full completion URL.
    #[serde(default)]
    pub llm_api_url: Option<String>,
    /// Base URL (e.g. `http://host/v1`), used when `llm_api_url` is absent.
    #[serde(default)]
    pub llm_api_base: Option<String>,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// Environment variable holding the key.
    #[serde(default)]
    pub llm_api_key_env: Option<String>,
    #[serde(default)]
    pub framing: Framing,
    /// Extra fields merged into every request body.
    #[serde(default)]
    pub llm_options: serde_json::Map<String, serde_json::Value>,
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                return Err(RelayError::Config(format!(
                    "cannot read config {}: {}",
                    path.display(),
                    e
                ))
                .into())
            }
        };
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| RelayError::Config(format!("malformed config: {}", e)).into())
    }

    /// The explicit `default_model`, or the only configured model.
    pub fn default_model_name(&self) -> Result<String> {
        if let Some(name) = &self.default_model {
            return Ok(name.clone());
        }
        let mut names = self.llm_models.keys();
        match (names.next(), names.next()) {
            (Some(only), None) => Ok(only.clone()),
            (None, _) => Err(RelayError::Config("no models configured".into()).into()),
            (Some(_), Some(_)) => Err(RelayError::Config(
                "default_model is required when several models are configured".into(),
            )
            .into()),
        }
    }
}

impl ModelEntry {
    pub fn endpoint(&self) -> Option<String> {
        if let Some(url) = self.llm_api_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Some(url.trim().to_string());
        }
        self.llm_api_base
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(|base| format!("{}{}", base.trim_end_matches('/'), CHAT_COMPLETIONS_PATH))
    }

    /// A literal key wins over the environment variable.
    pub fn credential(&self) -> Option<String> {
        if let Some(key) = self.llm_api_key.as_deref().filter(|k| !k.is_empty()) {
            return Some(key.to_string());
        }
        let var = self.llm_api_key_env.as_deref()?;
        match std::env::var(var) {
            Ok(v) if !v.is_empty() => Some(v),
            _ => {
                tracing::warn!("Credential variable {} is unset or empty", var);
                None
            }
        }
    }
}
