//! Research pipeline state machine.
//!
//! ```text
//! Idle -> GeneratingQuery -> Searching -> Results
//!                                    \-> Error
//! ```
//!
//! A [`PipelineSession`] owns the observable state of one conversation. Each
//! `start` opens a new run with a larger run id, cancels the previous run and
//! resets the state; a run may only publish while its id is still current,
//! so a superseded run can never overwrite a newer one.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use lookout_client::{Cancelled, ResultEngine, SearchOutcome};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    command::LookoutCommand,
    endpoint::SearchRequest,
    error::ValidationError,
    query::{GeneratedQuery, QueryGenerator},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineStage {
    #[default]
    Idle,
    GeneratingQuery,
    Searching,
    Results,
    Error,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Results | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::GeneratingQuery => "generatingQuery",
            Self::Searching => "searching",
            Self::Results => "results",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub run_id: u64,
    pub stage: PipelineStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<LookoutCommand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated: Option<GeneratedQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SearchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineState {
    fn idle(run_id: u64) -> Self {
        Self {
            run_id,
            ..Self::default()
        }
    }
}

/// Write access to a session's state for exactly one run.
pub struct StatePublisher {
    state: Arc<watch::Sender<PipelineState>>,
    run_id: u64,
}

impl StatePublisher {
    fn new(state: Arc<watch::Sender<PipelineState>>, run_id: u64) -> Self {
        Self { state, run_id }
    }

    /// Publisher over a private channel, for running the pipeline without a session.
    pub fn detached() -> (Self, watch::Receiver<PipelineState>) {
        let (tx, rx) = watch::channel(PipelineState::default());
        (Self::new(Arc::new(tx), 0), rx)
    }

    /// Returns false once the run has been superseded.
    fn publish(&self, next: &PipelineState) -> bool {
        self.state.send_if_modified(|current| {
            if current.run_id != self.run_id {
                return false;
            }
            *current = next.clone();
            true
        })
    }
}

/// One invocation: query generation, then search.
pub struct Pipeline {
    generator: Arc<QueryGenerator>,
    engine: Arc<ResultEngine>,
    prioritize_videos: bool,
}

impl Pipeline {
    pub fn new(
        generator: Arc<QueryGenerator>,
        engine: Arc<ResultEngine>,
        prioritize_videos: bool,
    ) -> Self {
        Self {
            generator,
            engine,
            prioritize_videos,
        }
    }

    /// Drives a command to a terminal state, publishing every transition.
    ///
    /// Only cancellation is an `Err`. Validation failures end in
    /// [`PipelineStage::Error`] with no outcome; search failures end in
    /// [`PipelineStage::Error`] with the fallback outcome attached.
    #[instrument(name = "lookout_core.pipeline", skip_all, fields(run_id = publisher.run_id))]
    pub async fn run(
        &self,
        command: LookoutCommand,
        cancel: &CancellationToken,
        publisher: &StatePublisher,
    ) -> Result<PipelineState, Cancelled> {
        let mut state = PipelineState {
            run_id: publisher.run_id,
            command: Some(command.clone()),
            ..PipelineState::default()
        };

        if !command.is_command {
            state.stage = PipelineStage::Error;
            state.error = Some(ValidationError::NotACommand.to_string());
            publisher.publish(&state);
            return Ok(state);
        }

        state.stage = PipelineStage::GeneratingQuery;
        publisher.publish(&state);
        let generated = self
            .generator
            .generate(
                &command.question,
                command.highlighted_context.as_deref(),
                cancel,
            )
            .await?;
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        state.stage = PipelineStage::Searching;
        state.generated = Some(generated.clone());
        publisher.publish(&state);

        let request = match SearchRequest::new(&generated.search_query, self.prioritize_videos) {
            Ok(request) => request,
            Err(error) => {
                warn!(target: "lookout_core", error = %error, "generated query rejected");
                state.stage = PipelineStage::Error;
                state.error = Some(error.to_string());
                publisher.publish(&state);
                return Ok(state);
            }
        };

        let outcome = self
            .engine
            .search(&request.query, request.prioritize_videos, cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        state.stage = if outcome.success {
            PipelineStage::Results
        } else {
            PipelineStage::Error
        };
        state.error.clone_from(&outcome.error);
        state.outcome = Some(outcome);
        if !publisher.publish(&state) {
            debug!(target: "lookout_core", "run superseded before publishing its result");
        }
        info!(
            target: "lookout_core",
            stage = %state.stage,
            results = state.outcome.as_ref().map_or(0, |outcome| outcome.results.len()),
            "pipeline finished"
        );
        Ok(state)
    }
}

/// A started run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: u64,
    cancel: CancellationToken,
    task: JoinHandle<Result<PipelineState, Cancelled>>,
}

impl RunHandle {
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Terminal state of the run, or `Cancelled` if it was superseded or closed.
    pub async fn wait(self) -> Result<PipelineState, Cancelled> {
        match self.task.await {
            Ok(result) => result,
            Err(error) => {
                warn!(target: "lookout_core", run_id = self.run_id, error = %error, "pipeline task aborted");
                Err(Cancelled)
            }
        }
    }
}

struct ActiveRun {
    run_id: u64,
    cancel: CancellationToken,
}

/// Observable pipeline state for one conversation.
pub struct PipelineSession {
    pipeline: Arc<Pipeline>,
    state: Arc<watch::Sender<PipelineState>>,
    next_run: AtomicU64,
    active: Mutex<Option<ActiveRun>>,
    last_command: Mutex<Option<LookoutCommand>>,
}

impl PipelineSession {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let (state, _) = watch::channel(PipelineState::default());
        Self {
            pipeline,
            state: Arc::new(state),
            next_run: AtomicU64::new(0),
            active: Mutex::new(None),
            last_command: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// Cancels any in-flight run and starts `command` from a fresh state.
    pub async fn start(&self, command: LookoutCommand) -> RunHandle {
        let mut active = self.active.lock().await;
        let run_id = self.begin_run(active.take());
        *self.last_command.lock().await = Some(command.clone());

        let cancel = CancellationToken::new();
        let publisher = StatePublisher::new(self.state.clone(), run_id);
        let pipeline = self.pipeline.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { pipeline.run(command, &token, &publisher).await });

        *active = Some(ActiveRun {
            run_id,
            cancel: cancel.clone(),
        });
        RunHandle {
            run_id,
            cancel,
            task,
        }
    }

    /// Re-runs the last command, if there is one.
    pub async fn retry(&self) -> Option<RunHandle> {
        let command = self.last_command.lock().await.clone()?;
        debug!(target: "lookout_core", question = %command.question, "retrying last command");
        Some(self.start(command).await)
    }

    /// Cancels the active run and discards the state.
    pub async fn close(&self) {
        let mut active = self.active.lock().await;
        self.begin_run(active.take());
        self.last_command.lock().await.take();
    }

    /// Whether a run is currently active and not yet terminal.
    pub async fn is_running(&self) -> bool {
        let active = self.active.lock().await;
        active.as_ref().is_some_and(|run| {
            let state = self.state.borrow();
            state.run_id == run.run_id && !state.stage.is_terminal() && !run.cancel.is_cancelled()
        })
    }

    fn begin_run(&self, previous: Option<ActiveRun>) -> u64 {
        if let Some(previous) = previous {
            debug!(target: "lookout_core", run_id = previous.run_id, "cancelling superseded run");
            previous.cancel.cancel();
        }
        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(PipelineState::idle(run_id));
        run_id
    }
}

impl std::fmt::Debug for PipelineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSession")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CompletionProvider, ProviderError};
    use async_trait::async_trait;
    use lookout_client::{ClientError, InstantAnswer, SearchBackend, SessionCache};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl CompletionProvider for Echo {
        async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
            Ok("rust ownership explained".to_string())
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    struct Down;

    #[async_trait]
    impl SearchBackend for Down {
        async fn fetch(&self, _query: &str) -> Result<InstantAnswer, ClientError> {
            Err(ClientError::Http("unreachable".into()))
        }
    }

    fn pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            Arc::new(QueryGenerator::new(Arc::new(Echo), Duration::from_secs(10))),
            Arc::new(ResultEngine::new(Arc::new(Down), Arc::new(SessionCache::new()))),
            true,
        ))
    }

    #[test]
    fn terminal_stages() {
        assert!(PipelineStage::Results.is_terminal());
        assert!(PipelineStage::Error.is_terminal());
        assert!(!PipelineStage::Searching.is_terminal());
        assert_eq!(
            serde_json::to_value(PipelineStage::GeneratingQuery).expect("serialize"),
            "generatingQuery"
        );
    }

    #[tokio::test]
    async fn non_command_ends_in_error_without_results() {
        let (publisher, rx) = StatePublisher::detached();
        let state = pipeline()
            .run(LookoutCommand::default(), &CancellationToken::new(), &publisher)
            .await
            .expect("not cancelled");
        assert_eq!(state.stage, PipelineStage::Error);
        assert!(state.outcome.is_none());
        assert_eq!(rx.borrow().stage, PipelineStage::Error);
    }

    #[tokio::test]
    async fn search_failure_keeps_fallback_results() {
        let (publisher, _rx) = StatePublisher::detached();
        let command = crate::command::detect("@lookout ownership", &["let x = 5;"]);
        let state = pipeline()
            .run(command, &CancellationToken::new(), &publisher)
            .await
            .expect("not cancelled");
        assert_eq!(state.stage, PipelineStage::Error);
        let outcome = state.outcome.expect("fallback outcome");
        assert_eq!(outcome.results.len(), lookout_client::FALLBACK_RESULT_COUNT);
        assert_eq!(outcome.search_query, "rust ownership explained");
    }

    #[tokio::test]
    async fn stale_publisher_cannot_overwrite() {
        let session = PipelineSession::new(pipeline());
        let stale = StatePublisher::new(session.state.clone(), 1);
        session.close().await;
        session.close().await;

        let written = stale.publish(&PipelineState {
            run_id: 1,
            stage: PipelineStage::Results,
            ..PipelineState::default()
        });
        assert!(!written);
        assert_eq!(session.state().stage, PipelineStage::Idle);
    }

    #[tokio::test]
    async fn retry_without_history_does_nothing() {
        let session = PipelineSession::new(pipeline());
        assert!(session.retry().await.is_none());
    }
}
