//! Recognition of `@lookout` commands in chat input.

use serde::{Deserialize, Serialize};

/// Default command prefix.
pub const TRIGGER_TOKEN: &str = "@lookout";

const SNIPPET_SEPARATOR: &str = "\n\n";

/// Result of parsing one chat message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookoutCommand {
    pub is_command: bool,
    /// Text after the trigger, trimmed. Empty when `is_command` is false.
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlighted_context: Option<String>,
}

/// Where a chat message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRoute {
    Lookout(LookoutCommand),
    Chat(String),
}

/// Matches a trigger at the start of the message, ignoring ASCII case.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    trigger: String,
}

impl Default for CommandDetector {
    fn default() -> Self {
        Self::new(TRIGGER_TOKEN)
    }
}

impl CommandDetector {
    pub fn new(trigger: impl Into<String>) -> Self {
        Self {
            trigger: trigger.into(),
        }
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn detect<S: AsRef<str>>(&self, input: &str, snippets: &[S]) -> LookoutCommand {
        let highlighted_context = join_snippets(snippets);
        match self.question(input) {
            Some(question) => LookoutCommand {
                is_command: true,
                question: question.to_string(),
                highlighted_context,
            },
            None => LookoutCommand {
                is_command: false,
                question: String::new(),
                highlighted_context,
            },
        }
    }

    pub fn is_valid(&self, input: &str) -> bool {
        self.question(input).is_some()
    }

    /// The question following the trigger, or an empty string.
    pub fn extract_question(&self, input: &str) -> String {
        self.question(input).unwrap_or_default().to_string()
    }

    pub fn route<S: AsRef<str>>(&self, input: &str, snippets: &[S]) -> ChatRoute {
        let command = self.detect(input, snippets);
        if command.is_command {
            ChatRoute::Lookout(command)
        } else {
            ChatRoute::Chat(input.to_string())
        }
    }

    fn question<'a>(&self, input: &'a str) -> Option<&'a str> {
        let trimmed = input.trim();
        let len = self.trigger.len();
        let head = trimmed.get(..len)?;
        if self.trigger.is_empty() || !head.eq_ignore_ascii_case(&self.trigger) {
            return None;
        }
        let rest = &trimmed[len..];
        // The trigger must be followed by whitespace, so "@lookoutfoo" is not a command.
        if !rest.starts_with(char::is_whitespace) {
            return None;
        }
        let question = rest.trim();
        (!question.is_empty()).then_some(question)
    }
}

fn join_snippets<S: AsRef<str>>(snippets: &[S]) -> Option<String> {
    if snippets.is_empty() {
        return None;
    }
    Some(
        snippets
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(SNIPPET_SEPARATOR),
    )
}

pub fn detect<S: AsRef<str>>(input: &str, snippets: &[S]) -> LookoutCommand {
    CommandDetector::default().detect(input, snippets)
}

pub fn is_valid(input: &str) -> bool {
    CommandDetector::default().is_valid(input)
}

pub fn extract_question(input: &str) -> String {
    CommandDetector::default().extract_question(input)
}

/// Chat integration: `@lookout` messages go to the pipeline, the rest to chat.
pub fn route_chat_input<S: AsRef<str>>(input: &str, snippets: &[S]) -> ChatRoute {
    CommandDetector::default().route(input, snippets)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_SNIPPETS: [&str; 0] = [];

    #[test]
    fn detects_trigger_with_question() {
        let command = detect("@lookout what is a monad?", &NO_SNIPPETS);
        assert!(command.is_command);
        assert_eq!(command.question, "what is a monad?");
        assert_eq!(command.highlighted_context, None);
    }

    #[test]
    fn trigger_is_case_insensitive_and_trimmed() {
        let command = detect("   @LookOut    explain   borrowing  ", &NO_SNIPPETS);
        assert!(command.is_command);
        assert_eq!(command.question, "explain   borrowing");
    }

    #[test]
    fn bare_trigger_is_not_a_command() {
        assert!(!detect("@lookout", &NO_SNIPPETS).is_command);
        assert!(!detect("@lookout    ", &NO_SNIPPETS).is_command);
        assert_eq!(extract_question("@lookout"), "");
    }

    #[test]
    fn trigger_must_be_a_whole_token() {
        assert!(!is_valid("@lookoutfoo bar"));
        assert!(!is_valid("hey @lookout what"));
        assert!(!is_valid("@look out"));
        assert!(!is_valid(""));
    }

    #[test]
    fn accepts_newline_after_trigger() {
        let command = detect("@lookout\nrust lifetimes", &NO_SNIPPETS);
        assert!(command.is_command);
        assert_eq!(command.question, "rust lifetimes");
    }

    #[test]
    fn snippets_are_joined_in_order() {
        let snippets = vec!["first".to_string(), "second".to_string()];
        let command = detect("@lookout compare these", &snippets);
        assert_eq!(
            command.highlighted_context.as_deref(),
            Some("first\n\nsecond")
        );
    }

    #[test]
    fn custom_trigger() {
        let detector = CommandDetector::new("@research");
        assert!(detector.is_valid("@research tides"));
        assert!(!detector.is_valid("@lookout tides"));
        assert_eq!(detector.trigger(), "@research");
    }

    #[test]
    fn multibyte_input_does_not_panic() {
        assert!(!is_valid("ééééé"));
        assert!(!is_valid("日本語のテキストです"));
    }

    #[test]
    fn routes_chat_and_commands() {
        assert_eq!(
            route_chat_input("hello there", &NO_SNIPPETS),
            ChatRoute::Chat("hello there".to_string())
        );
        match route_chat_input("@lookout tides", &["moon"]) {
            ChatRoute::Lookout(command) => {
                assert_eq!(command.question, "tides");
                assert_eq!(command.highlighted_context.as_deref(), Some("moon"));
            }
            ChatRoute::Chat(_) => panic!("expected a lookout route"),
        }
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(detect("@lookout x", &["ctx"])).expect("serialize");
        assert_eq!(value["isCommand"], true);
        assert_eq!(value["highlightedContext"], "ctx");
    }
}
