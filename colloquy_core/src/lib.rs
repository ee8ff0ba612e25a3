#![deny(
    clippy::all,
    clippy::nursery,
    clippy::pedantic,
    clippy::style,
    clippy::complexity,
    clippy::perf,
    clippy::correctness,
    clippy::suspicious,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::similar_names,
    clippy::missing_safety_doc,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod error;

pub use error::TransportError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
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

    /// Pinned messages survive context pruning.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.role == Role::System
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default, alias = "prompt_tokens")]
    pub prompt_tokens: u32,
    #[serde(default, alias = "completion_tokens")]
    pub completion_tokens: u32,
    #[serde(default, alias = "total_tokens")]
    pub total_tokens: u32,
}

/// Result of a single-shot completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: String,
    pub text: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// One parsed unit of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub id: String,
    pub delta_text: String,
    pub finish_reason: Option<String>,
}

/// Snapshot of an in-flight generation, replaced wholesale on every chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationProgress {
    pub message_id: String,
    pub accumulated_text: String,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationProgress {
    pub fn partial(message_id: impl Into<String>, accumulated_text: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            accumulated_text: accumulated_text.into(),
            is_complete: false,
            error: None,
        }
    }

    pub fn complete(message_id: impl Into<String>, accumulated_text: impl Into<String>) -> Self {
        Self {
            is_complete: true,
            ..Self::partial(message_id, accumulated_text)
        }
    }
}

/// Remote completion service as seen by the conversation engine.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<Completion, TransportError>;

    /// Streams a completion, calling `on_progress` for every chunk in arrival
    /// order and exactly once with `is_complete = true` on success.
    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        on_progress: &mut (dyn FnMut(GenerationProgress) + Send),
    ) -> Result<String, TransportError>;

    async fn count_tokens(&self, messages: &[ChatMessage]) -> Result<u64, TransportError>;
}

#[async_trait]
impl<T> CompletionBackend for Arc<T>
where
    T: CompletionBackend + ?Sized,
{
    async fn complete_once(&self, messages: &[ChatMessage]) -> Result<Completion, TransportError> {
        (**self).complete_once(messages).await
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        on_progress: &mut (dyn FnMut(GenerationProgress) + Send),
    ) -> Result<String, TransportError> {
        (**self).complete_streaming(messages, on_progress).await
    }

    async fn count_tokens(&self, messages: &[ChatMessage]) -> Result<u64, TransportError> {
        (**self).count_tokens(messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        let msg = ChatMessage::assistant("hi");
        let json = serde_json::to_value(&msg).unwrap_or_default();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn only_system_messages_are_pinned() {
        assert!(ChatMessage::system("rules").is_pinned());
        assert!(!ChatMessage::user("hello").is_pinned());
        assert!(!ChatMessage::assistant("hello").is_pinned());
    }

    #[test]
    fn usage_accepts_both_key_styles() {
        let camel: Usage =
            serde_json::from_str(r#"{"promptTokens":3,"completionTokens":4,"totalTokens":7}"#)
                .unwrap_or_default();
        let snake: Usage =
            serde_json::from_str(r#"{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}"#)
                .unwrap_or_default();
        assert_eq!(camel, snake);
        assert_eq!(camel.total_tokens, 7);
    }

    #[test]
    fn progress_serializes_camel_case_without_empty_error() {
        let progress = GenerationProgress::complete("m1", "ABC");
        let json = serde_json::to_value(&progress).unwrap_or_default();
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["accumulatedText"], "ABC");
        assert_eq!(json["isComplete"], true);
        assert!(json.get("error").is_none());
    }
}
