use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use lookout_client::CacheStatsSnapshot;
use serde_json::{json, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    command::LookoutCommand,
    endpoint::EndpointResponse,
    error::{LookoutError, ValidationError},
    pipeline::{PipelineStage, PipelineState},
    query::GeneratedQuery,
    state::{AppContext, TelemetryEntry},
};

/// Operation facade shared by the stdio server and the CLI. Every call is
/// timed and recorded in the bounded telemetry log.
#[derive(Clone)]
pub struct LookoutExecutor {
    context: Arc<AppContext>,
    options: ExecutorOptions,
}

#[derive(Clone)]
struct ExecutorOptions {
    record_telemetry: bool,
}

#[derive(Clone)]
pub struct LookoutExecutorBuilder {
    context: Arc<AppContext>,
    options: ExecutorOptions,
}

impl LookoutExecutorBuilder {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self {
            context,
            options: ExecutorOptions {
                record_telemetry: true,
            },
        }
    }

    #[must_use]
    pub fn record_telemetry(mut self, enabled: bool) -> Self {
        self.options.record_telemetry = enabled;
        self
    }

    pub fn build(self) -> LookoutExecutor {
        LookoutExecutor {
            context: self.context,
            options: self.options,
        }
    }
}

impl LookoutExecutor {
    pub fn builder(context: Arc<AppContext>) -> LookoutExecutorBuilder {
        LookoutExecutorBuilder::new(context)
    }

    pub fn context(&self) -> Arc<AppContext> {
        self.context.clone()
    }

    pub async fn detect(&self, text: &str, snippets: &[String]) -> LookoutCommand {
        let started = Instant::now();
        let command = self.context.detector.detect(text, snippets);
        self.record_success(
            "detect",
            started,
            Some(json!({ "isCommand": command.is_command })),
        )
        .await;
        command
    }

    /// `timeout` overrides the configured generation bound.
    pub async fn generate_query(
        &self,
        question: &str,
        context: Option<&str>,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<GeneratedQuery, ExecutorError> {
        let started = Instant::now();
        let generator = &self.context.generator;
        let result = generator
            .generate_within(
                question,
                context,
                timeout.unwrap_or_else(|| generator.timeout()),
                cancel,
            )
            .await
            .map_err(LookoutError::from);
        self.finish("query", started, result, |query| {
            json!({ "usedFallback": query.used_fallback })
        })
        .await
    }

    /// Handles a search request body as a POST.
    pub async fn search(
        &self,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<EndpointResponse, ExecutorError> {
        self.search_with_method("POST", body, cancel).await
    }

    pub async fn search_with_method(
        &self,
        method: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<EndpointResponse, ExecutorError> {
        let started = Instant::now();
        let result = self
            .context
            .endpoint
            .handle(method, body, cancel)
            .await
            .map_err(LookoutError::from);
        self.finish("search", started, result, |response| {
            json!({
                "status": response.status,
                "success": response.body.success,
                "results": response.body.results.len(),
            })
        })
        .await
    }

    /// Runs a chat message through the session's pipeline, reporting every
    /// non-idle state of this run to `on_state`.
    pub async fn ask<F>(
        &self,
        session_id: &str,
        text: &str,
        snippets: &[String],
        mut on_state: F,
    ) -> Result<PipelineState, ExecutorError>
    where
        F: FnMut(&PipelineState) + Send,
    {
        let started = Instant::now();
        let command = self.context.detector.detect(text, snippets);
        if !command.is_command {
            let result = Err(LookoutError::from(ValidationError::NotACommand));
            return self.finish("ask", started, result, |_: &PipelineState| Value::Null).await;
        }

        let session = self.context.session(session_id);
        let mut updates = session.subscribe();
        let handle = session.start(command).await;
        let run_id = handle.run_id();
        loop {
            let state = updates.borrow_and_update().clone();
            if state.run_id > run_id {
                break;
            }
            if state.run_id == run_id && state.stage != PipelineStage::Idle {
                on_state(&state);
                if state.stage.is_terminal() {
                    break;
                }
            }
            if updates.changed().await.is_err() {
                break;
            }
        }

        let result = handle.wait().await.map_err(LookoutError::from);
        self.finish("ask", started, result, |state| {
            json!({
                "stage": state.stage,
                "results": state.outcome.as_ref().map_or(0, |outcome| outcome.results.len()),
            })
        })
        .await
    }

    /// Re-runs the session's last command to completion.
    pub async fn retry(&self, session_id: &str) -> Result<Option<PipelineState>, ExecutorError> {
        let started = Instant::now();
        let session = self.context.session(session_id);
        let Some(handle) = session.retry().await else {
            return Ok(None);
        };
        let result = handle.wait().await.map_err(LookoutError::from);
        self.finish("retry", started, result, |state| json!({ "stage": state.stage }))
            .await
            .map(Some)
    }

    /// Closes the session, cancelling whatever it was doing.
    pub async fn cancel(&self, session_id: &str) -> bool {
        let started = Instant::now();
        let closed = self.context.close_session(session_id).await;
        self.record_success("cancel", started, Some(json!({ "closed": closed })))
            .await;
        closed
    }

    pub fn session_state(&self, session_id: &str) -> Option<PipelineState> {
        self.context
            .state
            .sessions
            .get(session_id)
            .map(|session| session.state())
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.context.cache().stats()
    }

    pub fn clear_cache(&self) {
        self.context.cache().clear();
    }

    pub async fn telemetry(&self) -> Vec<TelemetryEntry> {
        self.context.telemetry_snapshot().await
    }

    async fn finish<T>(
        &self,
        operation: &str,
        started: Instant,
        result: Result<T, LookoutError>,
        metadata: impl FnOnce(&T) -> Value,
    ) -> Result<T, ExecutorError> {
        match result {
            Ok(value) => {
                self.record_success(operation, started, Some(metadata(&value)))
                    .await;
                Ok(value)
            }
            Err(source) => {
                self.record_failure(operation, started, &source).await;
                Err(ExecutorError::Operation {
                    name: operation.to_string(),
                    source,
                })
            }
        }
    }

    async fn record_success(&self, operation: &str, started: Instant, metadata: Option<Value>) {
        if !self.options.record_telemetry {
            return;
        }
        let latency_ms = elapsed_ms(started);
        let entry = TelemetryEntry {
            operation: operation.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            latency_ms,
            success: true,
            metadata: metadata.clone(),
            error: None,
        };
        self.context.record_telemetry(entry).await;
        info!(
            target: "lookout_executor",
            operation,
            latency_ms,
            success = true,
            metadata = metadata.map_or_else(|| "null".to_string(), |value| value.to_string()),
            "operation completed"
        );
    }

    async fn record_failure(&self, operation: &str, started: Instant, error: &LookoutError) {
        if !self.options.record_telemetry {
            return;
        }
        let latency_ms = elapsed_ms(started);
        let entry = TelemetryEntry {
            operation: operation.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            latency_ms,
            success: false,
            metadata: None,
            error: Some(error.to_string()),
        };
        self.context.record_telemetry(entry).await;
        if error.is_user_visible() {
            warn!(target: "lookout_executor", operation, latency_ms, error = %error, "operation failed");
        } else {
            info!(target: "lookout_executor", operation, latency_ms, "operation cancelled");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("operation `{name}` failed: {source}")]
    Operation {
        name: String,
        #[source]
        source: LookoutError,
    },
}

impl ExecutorError {
    pub fn lookout_error(&self) -> &LookoutError {
        match self {
            Self::Operation { source, .. } => source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.lookout_error(), LookoutError::Cancelled)
    }
}
