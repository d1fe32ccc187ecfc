pub mod cache;
pub mod classify;
pub mod engine;
pub mod text;
pub mod types;

pub use cache::{CacheStatsSnapshot, SessionCache};
pub use engine::{
    fallback_outcome, ResultEngine, FALLBACK_ERROR, FALLBACK_RESULT_COUNT, MAX_RESULTS,
};
pub use types::{CacheKey, InstantAnswer, ResultKind, SearchOutcome, SearchResult};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.duckduckgo.com/";
const DEFAULT_USER_AGENT: &str = "Lookout/0.1 (research pipeline)";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("unexpected status code: {0}")]
    Status(StatusCode),
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Returned by every operation that observed its cancellation token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Remote instant-answer lookup.
///
/// Dropping the returned future must abort the underlying request; the
/// engine relies on this to cancel in-flight searches.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn fetch(&self, query: &str) -> Result<InstantAnswer, ClientError>;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct InstantAnswerClient {
    http: Client,
    config: ClientConfig,
}

impl InstantAnswerClient {
    pub fn with_config(config: ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout)
            .gzip(true)
            .build()
            .map_err(|err| ClientError::Http(err.to_string()))?;
        Ok(Self { http, config })
    }

    pub fn new() -> Result<Self, ClientError> {
        Self::with_config(ClientConfig::default())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn request_url(&self, query: &str) -> String {
        format!(
            "{}?q={}&format=json&no_html=1&skip_disambig=1",
            self.config.base_url,
            urlencoding::encode(query)
        )
    }
}

#[async_trait]
impl SearchBackend for InstantAnswerClient {
    #[instrument(name = "lookout_client.fetch", skip(self))]
    async fn fetch(&self, query: &str) -> Result<InstantAnswer, ClientError> {
        let url = self.request_url(query);
        debug!(target: "lookout_client", url = %url, "querying instant-answer service");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| ClientError::Http(err.to_string()))?;
        if !response.status().is_success() {
            warn!(target: "lookout_client", status = %response.status(), url, "instant-answer request failed");
            return Err(ClientError::Status(response.status()));
        }

        // The service labels JSON as javascript, so decode the raw bytes.
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ClientError::Http(err.to_string()))?;
        serde_json::from_slice::<InstantAnswer>(&bytes)
            .map_err(|err| ClientError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_url_encodes_query() {
        let client = InstantAnswerClient::new().expect("client builds");
        let url = client.request_url("what is a monad?");
        assert_eq!(
            url,
            "https://api.duckduckgo.com/?q=what%20is%20a%20monad%3F&format=json&no_html=1&skip_disambig=1"
        );
    }

    #[test]
    fn default_timeout_matches_search_bound() {
        assert_eq!(ClientConfig::default().timeout, Duration::from_secs(15));
    }
}
