use std::sync::Arc;

use dashmap::DashMap;
use lookout_client::{ResultEngine, SearchBackend, SessionCache};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    command::CommandDetector,
    config::LookoutConfig,
    endpoint::SearchEndpoint,
    pipeline::{Pipeline, PipelineSession, PipelineStage},
    provider::CompletionProvider,
    query::QueryGenerator,
};

const MAX_TELEMETRY_ENTRIES: usize = 200;
/// Registered sessions beyond which settled, unreferenced ones are dropped.
pub const MAX_SESSIONS: usize = 64;

/// Composition root: every long-lived component of a running instance.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<LookoutConfig>,
    pub detector: CommandDetector,
    pub generator: Arc<QueryGenerator>,
    pub engine: Arc<ResultEngine>,
    pub endpoint: SearchEndpoint,
    pub pipeline: Arc<Pipeline>,
    pub state: Arc<ServerState>,
}

impl AppContext {
    pub fn new(
        config: LookoutConfig,
        provider: Arc<dyn CompletionProvider>,
        backend: Arc<dyn SearchBackend>,
    ) -> Self {
        let cache = Arc::new(SessionCache::new());
        let engine = Arc::new(ResultEngine::new(backend, cache));
        let generator = Arc::new(QueryGenerator::new(provider, config.query_timeout()));
        let pipeline = Arc::new(Pipeline::new(
            generator.clone(),
            engine.clone(),
            config.prioritize_videos,
        ));
        Self {
            detector: CommandDetector::new(config.trigger.clone()),
            config: Arc::new(config),
            endpoint: SearchEndpoint::new(engine.clone()),
            generator,
            engine,
            pipeline,
            state: Arc::new(ServerState::default()),
        }
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        self.engine.cache()
    }

    /// The session registered under `id`, created on first use.
    pub fn session(&self, id: &str) -> Arc<PipelineSession> {
        if let Some(session) = self.state.sessions.get(id) {
            return session.clone();
        }
        if self.state.sessions.len() >= MAX_SESSIONS {
            self.prune_settled_sessions();
        }
        self.state
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(PipelineSession::new(self.pipeline.clone())))
            .clone()
    }

    /// Forgets sessions that are idle or finished and held by no caller.
    fn prune_settled_sessions(&self) {
        let before = self.state.sessions.len();
        self.state.sessions.retain(|_, session| {
            let stage = session.state().stage;
            let settled = stage == PipelineStage::Idle || stage.is_terminal();
            Arc::strong_count(session) > 1 || !settled
        });
        debug!(
            target: "lookout_core",
            pruned = before.saturating_sub(self.state.sessions.len()),
            "pruned settled sessions"
        );
    }

    /// Closes and forgets a session. Returns false if it did not exist.
    pub async fn close_session(&self, id: &str) -> bool {
        let Some((_, session)) = self.state.sessions.remove(id) else {
            return false;
        };
        session.close().await;
        true
    }

    pub async fn record_telemetry(&self, entry: TelemetryEntry) {
        let mut guard = self.state.telemetry_log.lock().await;
        guard.push(entry);
        if guard.len() > MAX_TELEMETRY_ENTRIES {
            let overflow = guard.len() - MAX_TELEMETRY_ENTRIES;
            guard.drain(0..overflow);
        }
    }

    pub async fn telemetry_snapshot(&self) -> Vec<TelemetryEntry> {
        self.state.telemetry_log.lock().await.clone()
    }
}

#[derive(Default)]
pub struct ServerState {
    pub sessions: DashMap<String, Arc<PipelineSession>>,
    pub telemetry_log: Mutex<Vec<TelemetryEntry>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEntry {
    pub operation: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::UnconfiguredProvider;
    use async_trait::async_trait;
    use lookout_client::{ClientError, InstantAnswer};

    struct Offline;

    #[async_trait]
    impl SearchBackend for Offline {
        async fn fetch(&self, _query: &str) -> Result<InstantAnswer, ClientError> {
            Err(ClientError::Http("offline".into()))
        }
    }

    fn context() -> AppContext {
        AppContext::new(
            LookoutConfig::default(),
            Arc::new(UnconfiguredProvider),
            Arc::new(Offline),
        )
    }

    fn entry(operation: &str) -> TelemetryEntry {
        TelemetryEntry {
            operation: operation.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            latency_ms: 1,
            success: true,
            metadata: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn telemetry_is_bounded() {
        let context = context();
        for index in 0..(MAX_TELEMETRY_ENTRIES + 25) {
            context.record_telemetry(entry(&format!("op-{index}"))).await;
        }
        let snapshot = context.telemetry_snapshot().await;
        assert_eq!(snapshot.len(), MAX_TELEMETRY_ENTRIES);
        assert_eq!(snapshot[0].operation, "op-25");
    }

    #[tokio::test]
    async fn sessions_are_reused_until_closed() {
        let context = context();
        let first = context.session("chat-1");
        let again = context.session("chat-1");
        assert!(Arc::ptr_eq(&first, &again));

        assert!(context.close_session("chat-1").await);
        assert!(!context.close_session("chat-1").await);
        assert!(!Arc::ptr_eq(&first, &context.session("chat-1")));
    }

    #[tokio::test]
    async fn settled_sessions_are_pruned_past_the_cap() {
        let context = context();
        let held = context.session("held");
        for index in 0..(MAX_SESSIONS * 3) {
            context.session(&format!("chat-{index}"));
        }

        assert!(context.state.sessions.len() <= MAX_SESSIONS);
        assert!(Arc::ptr_eq(&held, &context.session("held")));
    }
}
