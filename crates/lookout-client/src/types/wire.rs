//! Wire model of the instant-answer service.
//!
//! The service returns loosely structured JSON: most fields are optional,
//! "absent" is frequently encoded as an empty string, and `RelatedTopics`
//! mixes plain topics with named groups of nested topics.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstantAnswer {
    #[serde(rename = "Heading", default)]
    pub heading: Option<String>,
    #[serde(rename = "Abstract", default)]
    pub r#abstract: Option<String>,
    #[serde(rename = "AbstractText", default)]
    pub abstract_text: Option<String>,
    #[serde(rename = "AbstractURL", default)]
    pub abstract_url: Option<String>,
    #[serde(rename = "Image", default)]
    pub image: Option<String>,
    #[serde(rename = "Definition", default)]
    pub definition: Option<String>,
    #[serde(rename = "DefinitionURL", default)]
    pub definition_url: Option<String>,
    #[serde(rename = "RelatedTopics", default)]
    pub related_topics: Option<Vec<RelatedTopic>>,
    #[serde(rename = "Results", default)]
    pub results: Option<Vec<RelatedTopic>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RelatedTopic {
    Group {
        #[serde(rename = "Name", default)]
        name: Option<String>,
        #[serde(rename = "Topics")]
        topics: Vec<RelatedTopic>,
    },
    Topic(Topic),
    Other(Value),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Topic {
    #[serde(rename = "FirstURL", default)]
    pub first_url: Option<String>,
    #[serde(rename = "Text", default)]
    pub text: Option<String>,
    /// HTML rendition of `Text`, used when `Text` is missing.
    #[serde(rename = "Result", default)]
    pub result: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl InstantAnswer {
    #[must_use]
    pub fn heading(&self) -> Option<&str> {
        non_empty(self.heading.as_ref())
    }

    #[must_use]
    pub fn abstract_text(&self) -> Option<&str> {
        non_empty(self.abstract_text.as_ref()).or_else(|| non_empty(self.r#abstract.as_ref()))
    }

    #[must_use]
    pub fn abstract_url(&self) -> Option<&str> {
        non_empty(self.abstract_url.as_ref())
    }

    #[must_use]
    pub fn image(&self) -> Option<&str> {
        non_empty(self.image.as_ref())
    }

    #[must_use]
    pub fn definition(&self) -> Option<&str> {
        non_empty(self.definition.as_ref())
    }

    #[must_use]
    pub fn definition_url(&self) -> Option<&str> {
        non_empty(self.definition_url.as_ref())
    }

    /// Related topics in document order, with groups flattened in place.
    #[must_use]
    pub fn topics(&self) -> Vec<&Topic> {
        let mut out = Vec::new();
        if let Some(topics) = &self.related_topics {
            flatten(topics, &mut out);
        }
        out
    }

    /// Entries of the secondary `Results` list.
    #[must_use]
    pub fn secondary_results(&self) -> Vec<&Topic> {
        let mut out = Vec::new();
        if let Some(results) = &self.results {
            flatten(results, &mut out);
        }
        out
    }
}

fn flatten<'a>(topics: &'a [RelatedTopic], out: &mut Vec<&'a Topic>) {
    for topic in topics {
        match topic {
            RelatedTopic::Group { topics, .. } => flatten(topics, out),
            RelatedTopic::Topic(entry) => out.push(entry),
            RelatedTopic::Other(_) => {}
        }
    }
}

impl Topic {
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        non_empty(self.first_url.as_ref())
    }

    #[must_use]
    pub fn text(&self) -> Option<&str> {
        non_empty(self.text.as_ref()).or_else(|| non_empty(self.result.as_ref()))
    }
}
