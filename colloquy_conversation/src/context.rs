//! Per-conversation message history.

use chrono::{DateTime, Utc};
use colloquy_core::ChatMessage;
use serde::Serialize;

use crate::history::HistoryConfig;

/// The ordered message history of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
    /// Touched on every append, not when a generation starts.
    pub last_updated: DateTime<Utc>,
}

impl ConversationContext {
    /// Create an empty context, seeded with a system message if given.
    #[must_use]
    pub fn new(conversation_id: impl Into<String>, system_prompt: Option<&str>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: system_prompt
                .map(|prompt| vec![ChatMessage::system(prompt)])
                .unwrap_or_default(),
            last_updated: Utc::now(),
        }
    }

    /// Append a message and trim back under the history limit.
    ///
    /// Returns the number of messages pruned.
    pub fn push(&mut self, message: ChatMessage, history: &HistoryConfig) -> usize {
        self.messages.push(message);
        self.last_updated = Utc::now();
        history.prune(&mut self.messages)
    }

    /// True if nothing was appended within `max_idle` before `now`.
    #[must_use]
    pub fn is_idle_since(&self, now: DateTime<Utc>, max_idle: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_updated) > max_idle
    }

    #[must_use]
    pub const fn message_count(&self) -> usize {
        self.messages.len()
    }
}
