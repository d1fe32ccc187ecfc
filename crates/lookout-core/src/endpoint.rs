use std::sync::Arc;

use lookout_client::{Cancelled, ResultEngine, SearchOutcome};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::ValidationError;

pub const MAX_QUERY_CHARS: usize = 500;
pub const METHOD_NOT_ALLOWED: &str = "Method not allowed";

/// A validated search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    /// Trimmed query text.
    pub query: String,
    pub prioritize_videos: bool,
}

impl SearchRequest {
    /// Length is measured in characters on the raw query, before trimming.
    pub fn new(query: &str, prioritize_videos: bool) -> Result<Self, ValidationError> {
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(ValidationError::QueryTooLong {
                max: MAX_QUERY_CHARS,
            });
        }
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyQuery);
        }
        Ok(Self {
            query: trimmed.to_string(),
            prioritize_videos,
        })
    }

    /// Validates a JSON body of the form
    /// `{ "query": string, "prioritizeVideos"?: boolean }`.
    ///
    /// An absent or null `prioritizeVideos` means `true`, matching the chat
    /// pipeline's default rather than the engine's `false`.
    pub fn from_value(body: &Value) -> Result<Self, ValidationError> {
        let object = body.as_object().ok_or(ValidationError::NotAnObject)?;
        let query = match object.get("query") {
            None | Some(Value::Null) => return Err(ValidationError::MissingQuery),
            Some(Value::String(query)) => query,
            Some(_) => return Err(ValidationError::QueryNotString),
        };
        let prioritize_videos = match object.get("prioritizeVideos") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => return Err(ValidationError::PrioritizeVideosNotBoolean),
        };
        Self::new(query, prioritize_videos)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointResponse {
    pub status: u16,
    pub body: SearchOutcome,
}

impl EndpointResponse {
    fn rejected(status: u16, query: &str, error: impl Into<String>) -> Self {
        Self {
            status,
            body: SearchOutcome::rejected(query, error),
        }
    }
}

/// Request/response surface over the result engine. Only POST is accepted.
#[derive(Clone)]
pub struct SearchEndpoint {
    engine: Arc<ResultEngine>,
}

impl SearchEndpoint {
    pub fn new(engine: Arc<ResultEngine>) -> Self {
        Self { engine }
    }

    #[instrument(name = "lookout_core.endpoint", skip(self, body, cancel))]
    pub async fn handle(
        &self,
        method: &str,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<EndpointResponse, Cancelled> {
        let raw_query = body
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !method.eq_ignore_ascii_case("POST") {
            return Ok(EndpointResponse::rejected(405, raw_query, METHOD_NOT_ALLOWED));
        }
        let request = match SearchRequest::from_value(body) {
            Ok(request) => request,
            Err(error) => {
                debug!(target: "lookout_core", error = %error, "rejected search request");
                return Ok(EndpointResponse::rejected(400, raw_query, error.to_string()));
            }
        };

        let outcome = self
            .engine
            .search(&request.query, request.prioritize_videos, cancel)
            .await?;
        Ok(EndpointResponse {
            status: 200,
            body: outcome,
        })
    }
}
