//! Host-based result classification.
//!
//! Classification consults [`RULES`] top to bottom and the first matching
//! pattern wins. Hosts that match no rule fall back to a prose heuristic on
//! the cleaned description: long, sentence-shaped text is an article,
//! anything else a plain link.

use reqwest::Url;

use crate::types::ResultKind;

const YOUTUBE_THUMBNAIL_BASE: &str = "https://img.youtube.com/vi";
const YOUTUBE_ID_LEN: usize = 11;
const PROSE_MIN_WORDS: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPattern {
    /// The domain itself or any subdomain of it.
    Domain(&'static str),
    /// Any host ending with the suffix, e.g. `.edu`.
    Suffix(&'static str),
}

impl HostPattern {
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        match self {
            Self::Domain(domain) => {
                let domain = *domain;
                host == domain
                    || host
                        .strip_suffix(domain)
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
            Self::Suffix(suffix) => host.ends_with(*suffix),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub pattern: HostPattern,
    pub kind: ResultKind,
}

const fn video(domain: &'static str) -> Rule {
    Rule {
        pattern: HostPattern::Domain(domain),
        kind: ResultKind::Video,
    }
}

const fn article(pattern: HostPattern) -> Rule {
    Rule {
        pattern,
        kind: ResultKind::Article,
    }
}

pub static RULES: &[Rule] = &[
    video("youtube.com"),
    video("youtu.be"),
    video("youtube-nocookie.com"),
    video("vimeo.com"),
    video("dailymotion.com"),
    video("twitch.tv"),
    video("ted.com"),
    article(HostPattern::Domain("wikipedia.org")),
    article(HostPattern::Domain("britannica.com")),
    article(HostPattern::Domain("khanacademy.org")),
    article(HostPattern::Domain("stackoverflow.com")),
    article(HostPattern::Domain("stackexchange.com")),
    article(HostPattern::Domain("quora.com")),
    article(HostPattern::Domain("medium.com")),
    article(HostPattern::Domain("developer.mozilla.org")),
    article(HostPattern::Domain("arxiv.org")),
    article(HostPattern::Domain("nature.com")),
    article(HostPattern::Domain("sciencedirect.com")),
    article(HostPattern::Suffix(".edu")),
];

/// Kind assigned by the rule table alone, if any rule matches.
#[must_use]
pub fn classify_host(host: &str) -> Option<ResultKind> {
    RULES
        .iter()
        .find(|rule| rule.pattern.matches(host))
        .map(|rule| rule.kind)
}

#[must_use]
pub fn classify(url: &Url, description: &str) -> ResultKind {
    let host = url.host_str().unwrap_or_default();
    classify_host(host).unwrap_or_else(|| {
        if looks_like_prose(description) {
            ResultKind::Article
        } else {
            ResultKind::Link
        }
    })
}

#[must_use]
pub fn looks_like_prose(text: &str) -> bool {
    text.split_whitespace().count() >= PROSE_MIN_WORDS
        && text.contains(|c| matches!(c, '.' | '!' | '?'))
}

#[must_use]
pub fn is_youtube_host(host: &str) -> bool {
    ["youtube.com", "youtu.be", "youtube-nocookie.com"]
        .iter()
        .any(|domain| HostPattern::Domain(*domain).matches(host))
}

/// Video identifier from watch, short-link, embed and shorts URLs.
#[must_use]
pub fn youtube_video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    if !is_youtube_host(host) {
        return None;
    }

    let mut segments = url.path_segments()?.filter(|segment| !segment.is_empty());
    let candidate = if HostPattern::Domain("youtu.be").matches(host) {
        segments.next().map(str::to_string)
    } else {
        match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            Some("embed" | "shorts" | "live" | "v") => segments.next().map(str::to_string),
            _ => None,
        }
    };

    candidate.filter(|id| is_video_id(id))
}

fn is_video_id(candidate: &str) -> bool {
    candidate.len() == YOUTUBE_ID_LEN
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[must_use]
pub fn youtube_thumbnail(video_id: &str) -> String {
    format!("{YOUTUBE_THUMBNAIL_BASE}/{video_id}/hqdefault.jpg")
}
