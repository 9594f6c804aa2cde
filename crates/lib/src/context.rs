//! Context compaction: build the message list sent to the model from the preset and the payload history.
//!
//! Once history grows past the trigger count, everything but the most recent messages is condensed
//! into a single summary system message. The preset is always sent first and never summarized.

use async_trait::async_trait;

use crate::config::ContextConfig;
use crate::llm::{InferenceClient, LlmError};
use crate::session::{Role, WireMessage};

pub const SUMMARY_TRIGGER_COUNT: usize = 24;
pub const MAX_CONTEXT_MESSAGES: usize = 16;
pub const SUMMARY_MAX_TOKENS: u32 = 512;
pub const SUMMARY_TEMPERATURE: f64 = 0.3;

const SUMMARY_INSTRUCTION: &str =
    "Summarize the conversation. Preserve goals, constraints, technical details. Be concise.";
const SUMMARY_PREFIX: &str = "Conversation summary:\n";

/// When to compact and how much to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Compact once the history holds more than this many messages.
    pub summary_trigger_count: usize,
    /// Messages kept verbatim after compaction.
    pub max_context_messages: usize,
    /// `max_tokens` for the summary request.
    pub summary_max_tokens: u32,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            summary_trigger_count: SUMMARY_TRIGGER_COUNT,
            max_context_messages: MAX_CONTEXT_MESSAGES,
            summary_max_tokens: SUMMARY_MAX_TOKENS,
        }
    }
}

impl From<&ContextConfig> for CompactionPolicy {
    fn from(c: &ContextConfig) -> Self {
        Self {
            summary_trigger_count: c.summary_trigger_count,
            max_context_messages: c.max_context_messages,
            summary_max_tokens: c.summary_max_tokens,
        }
    }
}

/// Condenses a prefix of the conversation into a short text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[WireMessage]) -> Result<String, LlmError>;
}

/// Summarizer backed by a non-streaming completion on the inference server.
pub struct RemoteSummarizer<'a> {
    client: &'a InferenceClient,
    model: &'a str,
    max_tokens: u32,
}

impl<'a> RemoteSummarizer<'a> {
    pub fn new(client: &'a InferenceClient, model: &'a str, max_tokens: u32) -> Self {
        Self {
            client,
            model,
            max_tokens,
        }
    }
}

/// Request messages for a summary: the fixed instruction followed by the messages to condense.
pub fn summary_request(messages: &[WireMessage]) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    out.push(WireMessage::system(SUMMARY_INSTRUCTION));
    out.extend_from_slice(messages);
    out
}

#[async_trait]
impl Summarizer for RemoteSummarizer<'_> {
    async fn summarize(&self, messages: &[WireMessage]) -> Result<String, LlmError> {
        log::debug!("summarizing {} messages", messages.len());
        self.client
            .complete(
                self.model,
                &summary_request(messages),
                SUMMARY_TEMPERATURE,
                Some(self.max_tokens),
            )
            .await
    }
}

/// Build the wire payload: `[preset?] [summary?] [...recent messages]`.
///
/// When summarization fails the older messages are dropped without a summary entry, so the request
/// still fits the window.
pub async fn build_payload(
    preset: &str,
    payload_messages: &[WireMessage],
    policy: &CompactionPolicy,
    summarizer: &dyn Summarizer,
) -> Vec<WireMessage> {
    let mut payload = Vec::with_capacity(payload_messages.len() + 2);
    if !preset.is_empty() {
        payload.push(WireMessage::system(preset));
    }

    let split = payload_messages
        .len()
        .saturating_sub(policy.max_context_messages);
    if payload_messages.len() <= policy.summary_trigger_count || split == 0 {
        payload.extend_from_slice(payload_messages);
        return payload;
    }

    let (older, recent) = payload_messages.split_at(split);
    match summarizer.summarize(older).await {
        Ok(summary) => {
            payload.push(WireMessage::system(format!("{}{}", SUMMARY_PREFIX, summary)));
        }
        Err(e) => {
            log::warn!(
                "summarizing {} older messages failed, trimming without summary: {}",
                older.len(),
                e
            );
        }
    }
    payload.extend_from_slice(recent);
    payload
}

/// Payload as persisted: the preset (if any) followed by the payload history.
pub fn export_payload(preset: &str, payload_messages: &[WireMessage]) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(payload_messages.len() + 1);
    if !preset.is_empty() {
        out.push(WireMessage::system(preset));
    }
    out.extend_from_slice(payload_messages);
    out
}

/// Split a persisted payload back into (preset, history). A leading system message is the saved
/// preset; it is adopted only when `current_preset` is empty, otherwise the current preset wins.
pub fn import_payload(current_preset: &str, saved: &[WireMessage]) -> (String, Vec<WireMessage>) {
    match saved.split_first() {
        Some((first, rest)) if first.role == Role::System => {
            let preset = if current_preset.is_empty() {
                first.content.clone()
            } else {
                current_preset.to_string()
            };
            (preset, rest.to_vec())
        }
        _ => (current_preset.to_string(), saved.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns a fixed summary and records what it was asked to condense.
    struct StaticSummarizer {
        summary: String,
        seen: Mutex<Vec<Vec<WireMessage>>>,
    }

    impl StaticSummarizer {
        fn new(summary: &str) -> Self {
            Self {
                summary: summary.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Summarizer for StaticSummarizer {
        async fn summarize(&self, messages: &[WireMessage]) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.summary.clone())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _messages: &[WireMessage]) -> Result<String, LlmError> {
            Err(LlmError::Api {
                status: 500,
                body: "boom".to_string(),
            })
        }
    }

    fn alternating(n: usize) -> Vec<WireMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    WireMessage::user(format!("u{}", i))
                } else {
                    WireMessage::assistant(format!("a{}", i))
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn short_history_passes_through() {
        let s = StaticSummarizer::new("X");
        let msgs = vec![WireMessage::user("hi")];
        let out = build_payload("", &msgs, &CompactionPolicy::default(), &s).await;
        assert_eq!(out, vec![WireMessage::user("hi")]);
        assert!(s.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exactly_at_trigger_is_not_compacted() {
        let s = StaticSummarizer::new("X");
        let msgs = alternating(24);
        let out = build_payload("preset", &msgs, &CompactionPolicy::default(), &s).await;
        assert_eq!(out.len(), 25);
        assert_eq!(out[0], WireMessage::system("preset"));
        assert_eq!(&out[1..], &msgs[..]);
    }

    #[tokio::test]
    async fn long_history_is_summarized_with_preset_first() {
        let s = StaticSummarizer::new("X");
        let msgs = alternating(30);
        let out = build_payload("You are terse.", &msgs, &CompactionPolicy::default(), &s).await;
        assert_eq!(out.len(), 18);
        assert_eq!(out[0], WireMessage::system("You are terse."));
        assert_eq!(out[1], WireMessage::system("Conversation summary:\nX"));
        assert_eq!(&out[2..], &msgs[14..]);

        let seen = s.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], msgs[..14].to_vec());
    }

    #[tokio::test]
    async fn failed_summary_trims_without_losing_preset() {
        let msgs = alternating(25);
        let out = build_payload("p", &msgs, &CompactionPolicy::default(), &FailingSummarizer).await;
        assert_eq!(out.len(), 17);
        assert_eq!(out[0], WireMessage::system("p"));
        assert_eq!(&out[1..], &msgs[9..]);
    }

    #[tokio::test]
    async fn custom_policy() {
        let s = StaticSummarizer::new("S");
        let policy = CompactionPolicy {
            summary_trigger_count: 4,
            max_context_messages: 2,
            summary_max_tokens: 64,
        };
        let msgs = alternating(5);
        let out = build_payload("", &msgs, &policy, &s).await;
        assert_eq!(out[0], WireMessage::system("Conversation summary:\nS"));
        assert_eq!(&out[1..], &msgs[3..]);
    }

    #[test]
    fn summary_request_starts_with_instruction() {
        let req = summary_request(&[WireMessage::user("q")]);
        assert_eq!(req[0].role, Role::System);
        assert!(req[0].content.starts_with("Summarize the conversation."));
        assert_eq!(req[1], WireMessage::user("q"));
    }

    #[test]
    fn export_then_import_restores_history() {
        let history = alternating(3);
        let saved = export_payload("persona", &history);
        assert_eq!(saved[0], WireMessage::system("persona"));

        let (preset, restored) = import_payload("", &saved);
        assert_eq!(preset, "persona");
        assert_eq!(restored, history);

        let (preset, restored) = import_payload("newer persona", &saved);
        assert_eq!(preset, "newer persona");
        assert_eq!(restored, history);
    }

    #[test]
    fn import_without_preset_keeps_everything() {
        let history = alternating(2);
        let (preset, restored) = import_payload("", &history);
        assert_eq!(preset, "");
        assert_eq!(restored, history);
    }
}
