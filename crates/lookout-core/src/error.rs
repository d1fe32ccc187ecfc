use lookout_client::Cancelled;
use thiserror::Error;

use crate::provider::ProviderError;

/// A malformed request parameter. Surfaced immediately, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("query is required")]
    MissingQuery,
    #[error("query must be a string")]
    QueryNotString,
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("query must be at most {max} characters")]
    QueryTooLong { max: usize },
    #[error("prioritizeVideos must be a boolean")]
    PrioritizeVideosNotBoolean,
    #[error("input is not a lookout command")]
    NotACommand,
}

/// Error kinds of the research pipeline.
///
/// Only [`LookoutError::Validation`] ends an invocation without results.
/// Provider and search-service failures are recovered where they happen
/// (original question, manual search links) and only ever show up as soft
/// error strings; cancellation is dropped silently.
#[derive(Debug, Clone, Error)]
pub enum LookoutError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("query generation failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("search service error: {0}")]
    SearchService(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for LookoutError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl LookoutError {
    /// Whether the pipeline stops without a result list.
    #[must_use]
    pub fn terminates_pipeline(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Whether the user should see anything about this error at all.
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}
