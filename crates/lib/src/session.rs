//! Conversation messages: the display transcript and the wire messages sent to the model.
//!
//! The transcript holds every visible turn with its timestamps. The wire payload is the
//! role/content list the model sees; it starts as a replay of the transcript but may be compacted.

use serde::{Deserialize, Serialize};

/// Speaker of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role/content pair as sent to the inference endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl WireMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A single transcript entry. `ts` is seconds since the epoch; `response_time` is only set on assistant replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
}

impl Message {
    /// User message stamped with the current time.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            ts: Some(now_ts()),
            response_time: None,
        }
    }

    /// Assistant reply stamped with the current time; `response_time` is rounded to two decimals.
    pub fn assistant(content: impl Into<String>, response_time: f64) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            ts: Some(now_ts()),
            response_time: Some((response_time * 100.0).round() / 100.0),
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Current time as fractional seconds since the Unix epoch.
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Turn literal `\n` escape sequences (backslash + n) into real newlines.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\\n", "\n")
}

/// Rebuild the wire payload by replaying the transcript in order. Any earlier compaction is discarded.
pub fn replay(transcript: &[Message]) -> Vec<WireMessage> {
    transcript.iter().map(Message::to_wire).collect()
}

/// Index of the most recent user message.
pub fn last_user_index(transcript: &[Message]) -> Option<usize> {
    transcript.iter().rposition(|m| m.role == Role::User)
}

/// Drop the assistant reply directly after `user_index`, if any. Returns true when one was removed.
fn drop_reply_after(transcript: &mut Vec<Message>, user_index: usize) -> bool {
    let next = user_index + 1;
    if transcript.get(next).map(|m| m.role) == Some(Role::Assistant) {
        transcript.remove(next);
        true
    } else {
        false
    }
}

/// Replace the last user message's content and timestamp, dropping the reply that followed it.
/// Returns the index of the edited message, or None when there is no user message.
pub fn edit_last_user(transcript: &mut Vec<Message>, new_text: &str) -> Option<usize> {
    let idx = last_user_index(transcript)?;
    drop_reply_after(transcript, idx);
    let msg = &mut transcript[idx];
    msg.content = new_text.to_string();
    msg.ts = Some(now_ts());
    Some(idx)
}

/// Remove the last user message and the assistant reply that followed it.
/// Returns false (and changes nothing) when there is no user message.
pub fn delete_last_exchange(transcript: &mut Vec<Message>) -> bool {
    let Some(idx) = last_user_index(transcript) else {
        return false;
    };
    drop_reply_after(transcript, idx);
    transcript.remove(idx);
    true
}

/// Drop a trailing assistant message and return the content of the most recent remaining user message.
/// Returns None (leaving the transcript untouched) when no user message exists.
pub fn prepare_regenerate(transcript: &mut Vec<Message>) -> Option<String> {
    let idx = last_user_index(transcript)?;
    if transcript.last().map(|m| m.role) == Some(Role::Assistant) {
        transcript.pop();
    }
    Some(transcript[idx].content.clone())
}
