//! Runtime configuration.
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `LOOKOUT__*` environment variables using `__`
//! between nested keys (`LOOKOUT__PROVIDER__API_KEY=...`).

use std::{path::Path, time::Duration};

use lookout_client::ClientConfig;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::TRIGGER_TOKEN;

pub const ENV_PREFIX: &str = "LOOKOUT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookoutConfig {
    /// Command prefix recognized in chat input.
    pub trigger: String,
    /// Upper bound for AI query generation before falling back.
    pub query_timeout_ms: u64,
    /// Put video results ahead of everything else.
    pub prioritize_videos: bool,
    pub search: SearchConfig,
    pub provider: ProviderConfig,
}

impl Default for LookoutConfig {
    fn default() -> Self {
        Self {
            trigger: TRIGGER_TOKEN.to_string(),
            query_timeout_ms: 10_000,
            prioritize_videos: true,
            search: SearchConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            base_url: client.base_url,
            timeout_ms: u64::try_from(client.timeout.as_millis()).unwrap_or(15_000),
            user_agent: client.user_agent,
        }
    }
}

impl SearchConfig {
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible chat completions API.
    pub base_url: String,
    pub model: String,
    /// Without a key every query falls back to the user's question.
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            max_tokens: 64,
            temperature: 0.2,
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl LookoutConfig {
    /// Load defaults, the optional file at `path`, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Self = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trigger.trim().is_empty() {
            return Err(ConfigError::Invalid("trigger must not be empty".into()));
        }
        if self.trigger.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(
                "trigger must not contain whitespace".into(),
            ));
        }
        if self.query_timeout_ms == 0 || self.search.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        for (name, url) in [
            ("search.base_url", &self.search.base_url),
            ("provider.base_url", &self.provider.base_url),
        ] {
            let parsed =
                Url::parse(url).map_err(|err| ConfigError::Invalid(format!("{name}: {err}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be an http(s) URL"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}
