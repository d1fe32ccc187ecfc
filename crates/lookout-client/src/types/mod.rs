pub mod wire;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use wire::{InstantAnswer, RelatedTopic, Topic};

/// Presentation category of a search result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Video,
    Article,
    Link,
}

impl ResultKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Article => "article",
            Self::Link => "link",
        }
    }
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single classified, display-ready result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ResultKind,
    pub title: String,
    pub description: String,
    /// Absolute URL handed to the presentation layer when the result is opened.
    pub url: String,
    /// Literal host of `url`.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

/// Ordered result list plus the query that produced it.
///
/// A failed search still carries a navigable list (the manual search links)
/// next to the soft `error` string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    pub success: bool,
    pub results: Vec<SearchResult>,
    pub search_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SearchOutcome {
    /// An outcome with no results, used for rejected requests.
    #[must_use]
    pub fn rejected(search_query: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            results: Vec::new(),
            search_query: search_query.into(),
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn video_count(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.kind == ResultKind::Video)
            .count()
    }
}

/// Session cache key: the lowercased, trimmed query plus the video flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    query: String,
    prioritize_videos: bool,
}

impl CacheKey {
    #[must_use]
    pub fn new(query: &str, prioritize_videos: bool) -> Self {
        Self {
            query: query.trim().to_lowercase(),
            prioritize_videos,
        }
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn prioritize_videos(&self) -> bool {
        self.prioritize_videos
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub outcome: SearchOutcome,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_normalizes_case_and_whitespace() {
        assert_eq!(
            CacheKey::new("  Rust Ownership ", true),
            CacheKey::new("rust ownership", true)
        );
        assert_ne!(
            CacheKey::new("rust ownership", true),
            CacheKey::new("rust ownership", false)
        );
    }

    #[test]
    fn search_result_serializes_kind_as_type() {
        let result = SearchResult {
            id: "topic-0".to_string(),
            kind: ResultKind::Video,
            title: "Intro".to_string(),
            description: String::new(),
            url: "https://youtu.be/dQw4w9WgXcQ".to_string(),
            source: "youtu.be".to_string(),
            thumbnail: None,
        };

        let value = serde_json::to_value(&result).expect("serializes");
        assert_eq!(value["type"], "video");
        assert!(value.get("thumbnail").is_none());
    }
}
