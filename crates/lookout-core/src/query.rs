//! Turns a user question into a search query with a bounded AI call.

use std::{sync::Arc, time::Duration};

use lookout_client::Cancelled;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{endpoint::MAX_QUERY_CHARS, error::LookoutError, provider::CompletionProvider};

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackReason {
    Timeout,
    ProviderError,
    EmptyResponse,
}

impl FallbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ProviderError => "provider-error",
            Self::EmptyResponse => "empty-response",
        }
    }
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a query came to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryGeneration {
    Generated(String),
    Fallback { query: String, reason: FallbackReason },
}

impl QueryGeneration {
    pub fn query(&self) -> &str {
        match self {
            Self::Generated(query) | Self::Fallback { query, .. } => query,
        }
    }

    pub fn into_generated_query(self, original_question: &str) -> GeneratedQuery {
        match self {
            Self::Generated(search_query) => GeneratedQuery {
                original_question: original_question.to_string(),
                search_query,
                used_fallback: false,
                error: None,
            },
            Self::Fallback { query, reason } => GeneratedQuery {
                original_question: original_question.to_string(),
                search_query: query,
                used_fallback: true,
                error: Some(reason.as_str().to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedQuery {
    pub original_question: String,
    pub search_query: String,
    pub used_fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Prompt asking for a short keyword query.
pub fn build_prompt(question: &str, context: Option<&str>) -> String {
    let mut prompt = String::from(
        "Rewrite the question below as a short web search query (about 3 to 8 keywords). \
         Prefer terms that find explanatory videos and articles. \
         Reply with the query only, without quotes or explanation.\n\n",
    );
    prompt.push_str("Question: ");
    prompt.push_str(question.trim());
    if let Some(context) = context.map(str::trim).filter(|text| !text.is_empty()) {
        prompt.push_str("\n\nHighlighted context:\n");
        prompt.push_str(context);
    }
    prompt
}

/// Keeps the first non-empty line and strips wrapping quotes models like to add.
fn normalize_completion(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    let unquoted = line
        .trim_matches(|c| matches!(c, '"' | '\'' | '`'))
        .trim();
    (!unquoted.is_empty()).then(|| unquoted.to_string())
}

pub struct QueryGenerator {
    provider: Arc<dyn CompletionProvider>,
    timeout: Duration,
}

impl std::fmt::Debug for QueryGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryGenerator")
            .field("provider", &self.provider.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl QueryGenerator {
    pub fn new(provider: Arc<dyn CompletionProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn generate(
        &self,
        question: &str,
        context: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<GeneratedQuery, Cancelled> {
        self.generate_within(question, context, self.timeout, cancel)
            .await
    }

    /// Never fails except on cancellation: timeouts, provider errors, blank
    /// completions and completions too long to search with all fall back to
    /// the trimmed question.
    #[instrument(name = "lookout_core.generate_query", skip(self, context, cancel), fields(provider = self.provider.name()))]
    pub async fn generate_within(
        &self,
        question: &str,
        context: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<GeneratedQuery, Cancelled> {
        let prompt = build_prompt(question, context);
        let fallback = |reason| QueryGeneration::Fallback {
            query: question.trim().to_string(),
            reason,
        };

        let generation = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(target: "lookout_core", "query generation cancelled");
                return Err(Cancelled);
            }
            completed = tokio::time::timeout(timeout, self.provider.complete(&prompt)) => {
                match completed {
                    Err(_) => {
                        warn!(target: "lookout_core", timeout = ?timeout, "query generation timed out");
                        fallback(FallbackReason::Timeout)
                    }
                    Ok(Err(error)) => {
                        let error = LookoutError::from(error);
                        warn!(target: "lookout_core", error = %error, "falling back to the original question");
                        fallback(FallbackReason::ProviderError)
                    }
                    Ok(Ok(text)) => match normalize_completion(&text) {
                        Some(query) if query.chars().count() > MAX_QUERY_CHARS => {
                            warn!(
                                target: "lookout_core",
                                chars = query.chars().count(),
                                max = MAX_QUERY_CHARS,
                                "completion too long for a search query"
                            );
                            fallback(FallbackReason::ProviderError)
                        }
                        Some(query) => QueryGeneration::Generated(query),
                        None => fallback(FallbackReason::EmptyResponse),
                    },
                }
            }
        };

        info!(
            target: "lookout_core",
            query = generation.query(),
            fallback = matches!(generation, QueryGeneration::Fallback { .. }),
            "search query ready"
        );
        Ok(generation.into_generated_query(question))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, UnconfiguredProvider};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Scripted {
        reply: Result<String, ProviderError>,
        delay: Duration,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                delay: Duration::ZERO,
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok("too late".to_string()),
                delay,
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for Scripted {
        async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply.clone()
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn uses_provider_completion() {
        let provider = Scripted::replying("  \"monad tutorial haskell\"\nextra chatter");
        let generator = QueryGenerator::new(provider.clone(), DEFAULT_QUERY_TIMEOUT);

        let query = generator
            .generate("what is a monad?", Some("a monad is a monoid"), &CancellationToken::new())
            .await
            .expect("not cancelled");

        assert_eq!(query.search_query, "monad tutorial haskell");
        assert!(!query.used_fallback);
        assert_eq!(query.error, None);
        assert_eq!(query.original_question, "what is a monad?");
        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("what is a monad?"));
        assert!(prompts[0].contains("a monad is a monoid"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        let generator = QueryGenerator::new(Scripted::slow(Duration::from_secs(30)), DEFAULT_QUERY_TIMEOUT);

        let query = generator
            .generate_within("  tides  ", None, Duration::from_millis(1), &CancellationToken::new())
            .await
            .expect("not cancelled");

        assert!(query.used_fallback);
        assert_eq!(query.search_query, "tides");
        assert_eq!(query.error.as_deref(), Some("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn default_timeout_is_ten_seconds() {
        let generator = QueryGenerator::new(Scripted::slow(Duration::from_millis(9_999)), DEFAULT_QUERY_TIMEOUT);
        let query = generator
            .generate("tides", None, &CancellationToken::new())
            .await
            .expect("not cancelled");
        assert!(!query.used_fallback);

        let generator = QueryGenerator::new(Scripted::slow(Duration::from_millis(10_001)), DEFAULT_QUERY_TIMEOUT);
        let query = generator
            .generate("tides", None, &CancellationToken::new())
            .await
            .expect("not cancelled");
        assert!(query.used_fallback);
    }

    #[tokio::test]
    async fn provider_error_falls_back() {
        let generator = QueryGenerator::new(Arc::new(UnconfiguredProvider), DEFAULT_QUERY_TIMEOUT);
        let query = generator
            .generate("why is the sky blue", None, &CancellationToken::new())
            .await
            .expect("not cancelled");
        assert!(query.used_fallback);
        assert_eq!(query.search_query, "why is the sky blue");
        assert_eq!(query.error.as_deref(), Some("provider-error"));
    }

    #[tokio::test]
    async fn blank_completion_falls_back() {
        let generator = QueryGenerator::new(Scripted::replying(" \n \"\" "), DEFAULT_QUERY_TIMEOUT);
        let query = generator
            .generate("rust traits", None, &CancellationToken::new())
            .await
            .expect("not cancelled");
        assert!(query.used_fallback);
        assert_eq!(query.search_query, "rust traits");
        assert_eq!(query.error.as_deref(), Some("empty-response"));
    }

    #[tokio::test]
    async fn overlong_completion_falls_back() {
        let rambling = "rust ".repeat(120);
        let generator = QueryGenerator::new(Scripted::replying(&rambling), DEFAULT_QUERY_TIMEOUT);
        let query = generator
            .generate("  rust ownership  ", None, &CancellationToken::new())
            .await
            .expect("not cancelled");
        assert!(query.used_fallback);
        assert_eq!(query.search_query, "rust ownership");
        assert_eq!(query.error.as_deref(), Some("provider-error"));
    }

    #[tokio::test]
    async fn completion_at_the_limit_is_kept() {
        let exact = "a".repeat(MAX_QUERY_CHARS);
        let generator = QueryGenerator::new(Scripted::replying(&exact), DEFAULT_QUERY_TIMEOUT);
        let query = generator
            .generate("letters", None, &CancellationToken::new())
            .await
            .expect("not cancelled");
        assert!(!query.used_fallback);
        assert_eq!(query.search_query, exact);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_pending_provider() {
        let generator = Arc::new(QueryGenerator::new(
            Scripted::slow(Duration::from_secs(5)),
            DEFAULT_QUERY_TIMEOUT,
        ));
        let cancel = CancellationToken::new();
        let task = {
            let generator = generator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { generator.generate("tides", None, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        assert_eq!(task.await.expect("joins"), Err(Cancelled));
    }

    #[test]
    fn prompt_omits_blank_context() {
        let prompt = build_prompt("tides", Some("   "));
        assert!(!prompt.contains("Highlighted context"));
        assert!(prompt.ends_with("Question: tides"));
    }

    #[test]
    fn fallback_reason_serializes_kebab_case() {
        let value = serde_json::to_value(FallbackReason::ProviderError).expect("serialize");
        assert_eq!(value, "provider-error");
    }
}
