use crate::config::RelayConfig;
use crate::constants::RESERVED_REQUEST_KEYS;
use crate::framing::Framing;
use crate::types::{RelayError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One configured upstream model endpoint.
#[derive(Clone)]
pub struct ModelTarget {
    /// Registry key, as the client names it.
    pub name: String,
    /// Model id sent in the upstream request body.
    pub model_name: String,
    pub url: reqwest::Url,
    pub credential: Option<String>,
    pub framing: Framing,
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl fmt::Debug for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelTarget")
            .field("name", &self.name)
            .field("model_name", &self.model_name)
            .field("url", &self.url.as_str())
            .field("credential", &self.credential.as_ref().map(|_| "[REDACTED]"))
            .field("framing", &self.framing)
            .field("options", &self.options)
            .finish()
    }
}

/// Read-only after construction, so lookups need no locking.
pub struct ModelRegistry {
    targets: HashMap<String, Arc<ModelTarget>>,
    default: Arc<ModelTarget>,
}

impl ModelRegistry {
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let mut targets = HashMap::new();

        for (name, entry) in &config.llm_models {
            let endpoint = match entry.endpoint() {
                Some(e) => e,
                None => {
                    return Err(RelayError::Config(format!(
                        "model '{}' has neither llm_api_url nor llm_api_base",
                        name
                    ))
                    .into())
                }
            };
            let url = match reqwest::Url::parse(&endpoint) {
                Ok(u) => u,
                Err(e) => {
                    return Err(RelayError::Config(format!(
                        "model '{}' has an invalid URL '{}': {}",
                        name, endpoint, e
                    ))
                    .into())
                }
            };

            let mut options = entry.llm_options.clone();
            for key in RESERVED_REQUEST_KEYS {
                if options.remove(*key).is_some() {
                    tracing::warn!(
                        "Ignoring reserved key '{}' in llm_options of model '{}'",
                        key,
                        name
                    );
                }
            }

            let model_name = match entry.model_name.as_deref().filter(|m| !m.is_empty()) {
                Some(m) => m.to_string(),
                None => name.clone(),
            };

            targets.insert(
                name.clone(),
                Arc::new(ModelTarget {
                    name: name.clone(),
                    model_name,
                    url,
                    credential: entry.credential(),
                    framing: entry.framing,
                    options,
                }),
            );
        }

        let default_name = config.default_model_name()?;
        let default = match targets.get(&default_name) {
            Some(t) => t.clone(),
            None => {
                return Err(RelayError::Config(format!(
                    "default model '{}' is not configured",
                    default_name
                ))
                .into())
            }
        };

        tracing::info!(
            "Model registry loaded: {} model(s), default '{}'",
            targets.len(),
            default.name
        );

        Ok(Self { targets, default })
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<ModelTarget>> {
        match self.targets.get(name) {
            Some(t) => Ok(t.clone()),
            None => Err(RelayError::UnknownModel(name.to_string()).into()),
        }
    }

    pub fn default_target(&self) -> Arc<ModelTarget> {
        self.default.clone()
    }

    /// Absent or unknown names fall back to the default target. Never any other model.
    pub fn resolve_or_default(&self, name: Option<&str>) -> Arc<ModelTarget> {
        let requested = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(n) => n,
            None => return self.default_target(),
        };
        match self.resolve(requested) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(
                    "{}; falling back to default model '{}'",
                    e.inner,
                    self.default.name
                );
                self.default_target()
            }
        }
    }

    pub fn default_name(&self) -> &str {
        &self.default.name
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
