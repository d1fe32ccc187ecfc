use std::sync::Arc;

use anyhow::{Context, Result};
use lookout_client::{InstantAnswerClient, SearchBackend};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub mod command;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod provider;
pub mod query;
pub mod state;
pub mod transport;

pub use command::{
    detect, extract_question, is_valid, route_chat_input, ChatRoute, CommandDetector,
    LookoutCommand, TRIGGER_TOKEN,
};
pub use config::{ConfigError, LookoutConfig};
pub use endpoint::{EndpointResponse, SearchEndpoint, SearchRequest};
pub use error::{LookoutError, ValidationError};
pub use executor::{ExecutorError, LookoutExecutor, LookoutExecutorBuilder};
pub use pipeline::{Pipeline, PipelineSession, PipelineStage, PipelineState, RunHandle};
pub use provider::{CompletionProvider, OpenAiCompatibleProvider, ProviderError, UnconfiguredProvider};
pub use query::{FallbackReason, GeneratedQuery, QueryGeneration, QueryGenerator};
use state::AppContext;

/// Inputs required to bootstrap the core runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub lookout: LookoutConfig,
    /// Timestamp captured during process initialization for diagnostics.
    pub boot_timestamp: OffsetDateTime,
    pub mode: ServerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Stdio,
    Headless,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lookout: LookoutConfig::default(),
            boot_timestamp: OffsetDateTime::now_utc(),
            mode: ServerMode::Stdio,
        }
    }
}

#[derive(Clone)]
pub struct CoreRuntime {
    config: ServerConfig,
    executor: LookoutExecutor,
}

impl CoreRuntime {
    pub fn executor(&self) -> LookoutExecutor {
        self.executor.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn serve(&self) -> Result<()> {
        match self.config.mode {
            ServerMode::Stdio => transport::serve_stdio(self.executor.clone()).await?,
            ServerMode::Headless => {
                debug!(target: "lookout_core", "Headless mode: skipping transport loop");
            }
        }
        Ok(())
    }
}

/// Picks the provider from configuration: a key enables the OpenAI-compatible
/// client, otherwise every query falls back to the user's question.
fn completion_provider(config: &LookoutConfig) -> Arc<dyn CompletionProvider> {
    if config.provider.api_key.is_none() {
        info!(target: "lookout_core", "No completion provider configured; queries use the question as typed");
        return Arc::new(UnconfiguredProvider);
    }
    match OpenAiCompatibleProvider::new(config.provider.clone()) {
        Ok(provider) => Arc::new(provider),
        Err(error) => {
            warn!(target: "lookout_core", error = %error, "Completion provider unavailable");
            Arc::new(UnconfiguredProvider)
        }
    }
}

pub async fn bootstrap(config: ServerConfig) -> Result<CoreRuntime> {
    config.lookout.validate()?;
    let backend = InstantAnswerClient::with_config(config.lookout.search.client_config())
        .context("failed to build the instant-answer client")?;
    let provider = completion_provider(&config.lookout);
    bootstrap_with(config, provider, Arc::new(backend)).await
}

/// Like [`bootstrap`] with explicit collaborators.
pub async fn bootstrap_with(
    config: ServerConfig,
    provider: Arc<dyn CompletionProvider>,
    backend: Arc<dyn SearchBackend>,
) -> Result<CoreRuntime> {
    let provider_name = provider.name().to_string();
    let context = Arc::new(AppContext::new(config.lookout.clone(), provider, backend));

    info!(
        target: "lookout_core",
        trigger = %context.detector.trigger(),
        provider = %provider_name,
        search = %config.lookout.search.base_url,
        boot_timestamp = %config.boot_timestamp,
        mode = ?config.mode,
        "Core runtime starting"
    );

    let executor = LookoutExecutor::builder(context).build();
    Ok(CoreRuntime { config, executor })
}

pub async fn run(config: ServerConfig) -> Result<()> {
    bootstrap(config).await?.serve().await
}
