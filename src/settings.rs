use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::ModelDescriptor;
use crate::error::{ChatError, Result};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "x-ai/grok-4-fast";
pub const DEFAULT_STORAGE_KEY: &str = "polychat_data";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl From<&ModelDescriptor> for ModelParams {
    fn from(m: &ModelDescriptor) -> Self {
        Self {
            temperature: Some(m.temperature),
            max_tokens: Some(m.max_tokens),
            top_p: Some(m.top_p),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GlobalDefaults {
    pub default_model: Option<String>,
    pub model_params: Option<ModelParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestOverrides {
    pub model: Option<String>,
    pub model_params: Option<ModelParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveSettings {
    pub model: Option<String>,
    pub model_params: ModelParams,
}

/// Request overrides win over the session's model descriptor, which wins over global defaults.
pub fn resolve_effective_settings(
    global: &GlobalDefaults,
    session_model: Option<&str>,
    descriptor: Option<&ModelDescriptor>,
    request: &RequestOverrides,
) -> EffectiveSettings {
    let model = request
        .model
        .clone()
        .or_else(|| session_model.map(str::to_owned))
        .or_else(|| global.default_model.clone());

    let from_descriptor = descriptor.map(ModelParams::from);
    let layers = [
        request.model_params.as_ref(),
        from_descriptor.as_ref(),
        global.model_params.as_ref(),
    ];
    let model_params = ModelParams {
        temperature: layers.iter().flatten().find_map(|p| p.temperature),
        max_tokens: layers.iter().flatten().find_map(|p| p.max_tokens),
        top_p: layers.iter().flatten().find_map(|p| p.top_p),
    };

    EffectiveSettings { model, model_params }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_secs(1) }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt `attempt` (1-based): base, 2*base, 4*base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
    /// `None` selects the per-user data directory; `memory` keeps the blob in process.
    pub database_url: Option<String>,
    pub storage_key: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub history_window: usize,
    pub reveal_delay: Duration,
    pub app_title: String,
    pub referer: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: None,
            default_model: DEFAULT_MODEL.into(),
            database_url: None,
            storage_key: DEFAULT_STORAGE_KEY.into(),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            history_window: 20,
            reveal_delay: Duration::from_millis(5),
            app_title: "PolyChat - Multi-Model AI Chat".into(),
            referer: "http://localhost".into(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("POLYCHAT_BASE_URL") {
            cfg.base_url = v;
        }
        cfg.api_key = std::env::var("POLYCHAT_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        if let Ok(v) = std::env::var("POLYCHAT_DEFAULT_MODEL") {
            cfg.default_model = v;
        }
        cfg.database_url = std::env::var("POLYCHAT_DATABASE_URL").ok();
        if let Ok(v) = std::env::var("POLYCHAT_STORAGE_KEY") {
            cfg.storage_key = v;
        }
        cfg
    }

    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.base_url)
            .map_err(|e| ChatError::validation(format!("base_url {}: {e}", self.base_url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ChatError::validation(format!("base_url must be http(s): {}", self.base_url)));
        }
        if self.retry.max_attempts == 0 {
            return Err(ChatError::validation("retry.max_attempts must be at least 1"));
        }
        if self.storage_key.trim().is_empty() {
            return Err(ChatError::validation("storage_key must not be empty"));
        }
        Ok(())
    }

    pub fn global_defaults(&self) -> GlobalDefaults {
        GlobalDefaults { default_model: Some(self.default_model.clone()), model_params: None }
    }
}
