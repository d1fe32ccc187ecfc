//! Text-completion providers used for search-query generation.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::ProviderConfig;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("unexpected status code: {0}")]
    Status(StatusCode),
    #[error("malformed completion: {0}")]
    Decode(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// A black-box text-completion service.
///
/// Implementations are not expected to enforce a deadline; the query
/// generator bounds every call and drops the future on timeout.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError>;

    fn name(&self) -> &str;
}

/// Chat-completions client for OpenAI-compatible APIs.
pub struct OpenAiCompatibleProvider {
    http: Client,
    config: ProviderConfig,
    api_key: String,
}

impl std::fmt::Debug for OpenAiCompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let Some(api_key) = config.api_key.clone().filter(|key| !key.trim().is_empty()) else {
            return Err(ProviderError::Unavailable("no API key configured".into()));
        };
        let http = Client::builder()
            .build()
            .map_err(|err| ProviderError::Http(err.to_string()))?;
        Ok(Self {
            http,
            config,
            api_key,
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatibleProvider {
    #[instrument(name = "lookout_core.complete", skip(self, prompt), fields(model = %self.config.model))]
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| ProviderError::Http(err.to_string()))?;
        if !response.status().is_success() {
            warn!(target: "lookout_core", status = %response.status(), "completion request failed");
            return Err(ProviderError::Status(response.status()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProviderError::Http(err.to_string()))?;
        let reply: ChatResponse =
            serde_json::from_slice(&bytes).map_err(|err| ProviderError::Decode(err.to_string()))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        debug!(target: "lookout_core", chars = content.chars().count(), "completion received");
        Ok(content)
    }

    fn name(&self) -> &str {
        "openai-compatible"
    }
}

/// Stand-in when no provider is configured. Every call fails, so queries
/// fall back to the user's own question.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredProvider;

#[async_trait]
impl CompletionProvider for UnconfiguredProvider {
    async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Unavailable("no completion provider configured".into()))
    }

    fn name(&self) -> &str {
        "unconfigured"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn respond_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 16 * 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/v1/")
    }

    fn provider_for(base_url: String) -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new(ProviderConfig {
            base_url,
            api_key: Some("sk-test".into()),
            ..ProviderConfig::default()
        })
        .expect("provider builds")
    }

    #[test]
    fn requires_an_api_key() {
        let result = OpenAiCompatibleProvider::new(ProviderConfig::default());
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
    }

    #[test]
    fn completions_url_ignores_trailing_slash() {
        let provider = provider_for("http://localhost:8080/v1/".into());
        assert_eq!(
            provider.completions_url(),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn returns_first_choice_content() {
        let base = respond_once(
            "200 OK",
            r#"{"choices":[{"message":{"role":"assistant","content":"monad tutorial haskell"}}]}"#,
        )
        .await;
        let text = provider_for(base).complete("prompt").await.expect("completes");
        assert_eq!(text, "monad tutorial haskell");
    }

    #[tokio::test]
    async fn missing_choices_yield_empty_text() {
        let base = respond_once("200 OK", r#"{"choices":[]}"#).await;
        let text = provider_for(base).complete("prompt").await.expect("completes");
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let base = respond_once("429 Too Many Requests", "{}").await;
        let result = provider_for(base).complete("prompt").await;
        assert!(matches!(
            result,
            Err(ProviderError::Status(StatusCode::TOO_MANY_REQUESTS))
        ));
    }

    #[tokio::test]
    async fn unconfigured_provider_always_fails() {
        let result = UnconfiguredProvider.complete("anything").await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
    }
}
