use std::{collections::HashSet, sync::Arc};

use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::SessionCache,
    classify::{classify, youtube_thumbnail, youtube_video_id},
    text::{clean_description, clean_title, split_title},
    types::{InstantAnswer, ResultKind, SearchOutcome, SearchResult},
    Cancelled, SearchBackend,
};

pub const MAX_RESULTS: usize = 10;
pub const FALLBACK_ERROR: &str =
    "Search service temporarily unavailable. Here are some manual search options.";
pub const FALLBACK_RESULT_COUNT: usize = MANUAL_SEARCHES.len();

const IMAGE_ORIGIN: &str = "https://duckduckgo.com";

struct ManualSearch {
    id: &'static str,
    label: &'static str,
    url_prefix: &'static str,
    description: &'static str,
}

/// Manual search links offered when the service cannot produce results.
/// The video search always comes first.
const MANUAL_SEARCHES: [ManualSearch; 3] = [
    ManualSearch {
        id: "fallback-youtube",
        label: "YouTube",
        url_prefix: "https://www.youtube.com/results?search_query=",
        description: "Browse explainer videos about this topic on YouTube.",
    },
    ManualSearch {
        id: "fallback-web",
        label: "the web",
        url_prefix: "https://www.google.com/search?q=",
        description: "Run a regular web search for this topic.",
    },
    ManualSearch {
        id: "fallback-wikipedia",
        label: "Wikipedia",
        url_prefix: "https://en.wikipedia.org/w/index.php?search=",
        description: "Look the topic up in the encyclopedia.",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Abstract,
    Definition,
    Topic,
    Result,
}

impl Origin {
    fn as_str(self) -> &'static str {
        match self {
            Self::Abstract => "abstract",
            Self::Definition => "definition",
            Self::Topic => "topic",
            Self::Result => "result",
        }
    }
}

#[derive(Debug)]
struct Candidate {
    origin: Origin,
    raw_url: String,
    url: Url,
    text: String,
    title: Option<String>,
    image: Option<String>,
}

#[derive(Default)]
struct Harvest {
    candidates: Vec<Candidate>,
    seen: HashSet<String>,
}

impl Harvest {
    fn is_full(&self) -> bool {
        self.candidates.len() >= MAX_RESULTS
    }

    fn push(
        &mut self,
        origin: Origin,
        url: &str,
        text: &str,
        title: Option<&str>,
        image: Option<String>,
    ) {
        if self.is_full() {
            return;
        }
        let Some(parsed) = parse_result_url(url) else {
            debug!(target: "lookout_client", url, "skipping candidate with unusable url");
            return;
        };
        if !self.seen.insert(parsed.as_str().to_string()) {
            return;
        }
        self.candidates.push(Candidate {
            origin,
            raw_url: url.trim().to_string(),
            url: parsed,
            text: text.to_string(),
            title: title.map(str::to_string),
            image,
        });
    }
}

fn parse_result_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    let web = matches!(url.scheme(), "http" | "https");
    (web && url.host_str().is_some()).then_some(url)
}

fn resolve_image(raw: &str) -> Option<String> {
    if raw.starts_with('/') {
        return Some(format!("{IMAGE_ORIGIN}{raw}"));
    }
    parse_result_url(raw).map(|_| raw.to_string())
}

/// Abstract, definition, topics, then secondary results, up to
/// [`MAX_RESULTS`] unique URLs.
fn harvest(answer: &InstantAnswer) -> Vec<Candidate> {
    let mut harvest = Harvest::default();

    if let (Some(text), Some(url)) = (answer.abstract_text(), answer.abstract_url()) {
        let image = answer.image().and_then(resolve_image);
        harvest.push(Origin::Abstract, url, text, answer.heading(), image);
    }

    if let (Some(text), Some(url)) = (answer.definition(), answer.definition_url()) {
        harvest.push(Origin::Definition, url, text, answer.heading(), None);
    }

    let topics = answer
        .topics()
        .into_iter()
        .map(|topic| (Origin::Topic, topic))
        .chain(
            answer
                .secondary_results()
                .into_iter()
                .map(|topic| (Origin::Result, topic)),
        );
    for (origin, topic) in topics {
        if harvest.is_full() {
            break;
        }
        if let (Some(url), Some(text)) = (topic.url(), topic.text()) {
            harvest.push(origin, url, text, None, None);
        }
    }

    harvest.candidates
}

fn build_result(position: usize, candidate: Candidate) -> SearchResult {
    let (title, description) = match candidate.title.as_deref() {
        Some(title) => (clean_title(title), clean_description(&candidate.text)),
        None => split_title(&candidate.text),
    };
    let source = candidate.url.host_str().unwrap_or_default().to_string();
    let title = if title.is_empty() { source.clone() } else { title };
    let kind = classify(&candidate.url, &description);

    let thumbnail = match candidate.image {
        Some(image) => Some(image),
        None if kind == ResultKind::Video => {
            youtube_video_id(&candidate.url).map(|id| youtube_thumbnail(&id))
        }
        None => None,
    };

    SearchResult {
        id: format!("{}-{position}", candidate.origin.as_str()),
        kind,
        title,
        description,
        url: candidate.raw_url,
        source,
        thumbnail,
    }
}

/// Move every video ahead of the other results, keeping relative order.
fn videos_first(results: Vec<SearchResult>) -> Vec<SearchResult> {
    let (mut videos, others): (Vec<_>, Vec<_>) = results
        .into_iter()
        .partition(|result| result.kind == ResultKind::Video);
    videos.extend(others);
    videos
}

/// Normalize a service answer into an ordered, classified result list.
#[must_use]
pub fn classify_answer(answer: &InstantAnswer, prioritize_videos: bool) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = harvest(answer)
        .into_iter()
        .enumerate()
        .map(|(position, candidate)| build_result(position, candidate))
        .collect();

    if prioritize_videos {
        results = videos_first(results);
    }
    results.truncate(MAX_RESULTS);
    results
}

/// Outcome for a structurally valid answer. An answer without usable
/// entries degrades to [`fallback_outcome`] exactly like a failed request.
#[must_use]
pub fn build_outcome(query: &str, answer: &InstantAnswer, prioritize_videos: bool) -> SearchOutcome {
    let results = classify_answer(answer, prioritize_videos);
    if results.is_empty() {
        debug!(target: "lookout_client", query, "service returned no usable entries");
        return fallback_outcome(query);
    }
    SearchOutcome {
        success: true,
        results,
        search_query: query.to_string(),
        error: None,
    }
}

#[must_use]
pub fn fallback_outcome(query: &str) -> SearchOutcome {
    let query = query.trim();
    let encoded = urlencoding::encode(query);
    let results = MANUAL_SEARCHES
        .iter()
        .map(|manual| {
            let raw_url = format!("{}{encoded}", manual.url_prefix);
            let (kind, source) = match Url::parse(&raw_url) {
                Ok(url) => (
                    classify(&url, manual.description),
                    url.host_str().unwrap_or_default().to_string(),
                ),
                Err(_) => (ResultKind::Link, String::new()),
            };
            SearchResult {
                id: manual.id.to_string(),
                kind,
                title: clean_title(&format!("Search {} for \"{query}\"", manual.label)),
                description: manual.description.to_string(),
                url: raw_url,
                source,
                thumbnail: None,
            }
        })
        .collect();

    SearchOutcome {
        success: false,
        results,
        search_query: query.to_string(),
        error: Some(FALLBACK_ERROR.to_string()),
    }
}

/// Result Classification Engine: remote lookup, normalization and the
/// session cache in front of both.
pub struct ResultEngine {
    backend: Arc<dyn SearchBackend>,
    cache: Arc<SessionCache>,
}

impl ResultEngine {
    pub fn new(backend: Arc<dyn SearchBackend>, cache: Arc<SessionCache>) -> Self {
        Self { backend, cache }
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// Search through the session cache. Only cancellation is an error; any
    /// service failure yields the fallback outcome.
    #[instrument(name = "lookout_client.search", skip(self, cancel))]
    pub async fn search(
        &self,
        query: &str,
        prioritize_videos: bool,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        self.cache
            .get_or_compute(query, prioritize_videos, || {
                self.search_uncached(query, prioritize_videos, cancel)
            })
            .await
    }

    pub async fn search_uncached(
        &self,
        query: &str,
        prioritize_videos: bool,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome, Cancelled> {
        let query = query.trim();
        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(target: "lookout_client", query, "search cancelled before the service answered");
                return Err(Cancelled);
            }
            fetched = self.backend.fetch(query) => fetched,
        };

        let outcome = match fetched {
            Ok(answer) => build_outcome(query, &answer, prioritize_videos),
            Err(error) => {
                warn!(target: "lookout_client", query, error = %error, "search service failed; using manual search links");
                fallback_outcome(query)
            }
        };

        info!(
            target: "lookout_client",
            query,
            success = outcome.success,
            results = outcome.results.len(),
            videos = outcome.video_count(),
            "search completed"
        );
        Ok(outcome)
    }
}

impl std::fmt::Debug for ResultEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultEngine")
            .field("cache_entries", &self.cache.len())
            .finish_non_exhaustive()
    }
}
