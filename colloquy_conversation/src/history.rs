//! Conversation history bounds.
//!
//! A context never holds more than `max_messages` entries. System messages
//! are pinned: pruning only ever drops the oldest non-system messages.

use colloquy_core::{ChatMessage, Role};

/// Configuration for conversation history management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Maximum number of messages to keep in a context
    pub max_messages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_messages: 20 }
    }
}

impl HistoryConfig {
    /// Create a config with specific message limit.
    #[must_use]
    pub const fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = max;
        self
    }

    /// Trim `messages` in place so it fits the limit.
    ///
    /// Every system message is kept. Of the rest, only the most recent
    /// `max_messages - system_count` survive (none if the system messages
    /// alone fill the budget). Relative order is preserved: system messages
    /// stay where they were rather than being moved to the front.
    ///
    /// Returns the number of messages removed.
    pub fn prune(&self, messages: &mut Vec<ChatMessage>) -> usize {
        if messages.len() <= self.max_messages {
            return 0;
        }

        let pinned = messages.iter().filter(|m| m.is_pinned()).count();
        let keep_unpinned = self.max_messages.saturating_sub(pinned);
        let unpinned = messages.len() - pinned;
        let mut to_drop = unpinned.saturating_sub(keep_unpinned);
        let dropped = to_drop;

        messages.retain(|m| {
            if to_drop > 0 && !m.is_pinned() {
                to_drop -= 1;
                false
            } else {
                true
            }
        });
        dropped
    }
}

/// Statistics about conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStats {
    pub total_messages: usize,
    pub system_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub total_characters: usize,
    pub estimated_tokens: usize,
}

impl HistoryStats {
    #[must_use]
    pub fn of(history: &[ChatMessage]) -> Self {
        let count = |role: Role| history.iter().filter(|m| m.role == role).count();
        let total_characters: usize = history.iter().map(|m| m.content.chars().count()).sum();

        Self {
            total_messages: history.len(),
            system_messages: count(Role::System),
            user_messages: count(Role::User),
            assistant_messages: count(Role::Assistant),
            total_characters,
            estimated_tokens: total_characters / 4, // Rough estimate: 4 chars per token
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_messages(count: usize) -> Vec<ChatMessage> {
        (0..count)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("Message {i}"))
                } else {
                    ChatMessage::assistant(format!("Message {i}"))
                }
            })
            .collect()
    }

    #[test]
    fn test_under_limit_is_untouched() {
        let config = HistoryConfig::default().with_max_messages(5);
        let mut messages = create_test_messages(5);
        assert_eq!(config.prune(&mut messages), 0);
        assert_eq!(messages.len(), 5);
    }

    #[test]
    fn test_drops_oldest_non_system_first() {
        let config = HistoryConfig::default().with_max_messages(4);
        let mut messages = vec![ChatMessage::system("rules")];
        messages.extend(create_test_messages(6));

        assert_eq!(config.prune(&mut messages), 3);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], ChatMessage::system("rules"));
        let contents: Vec<_> = messages[1..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Message 3", "Message 4", "Message 5"]);
    }

    #[test]
    fn test_interleaved_system_messages_keep_their_position() {
        let config = HistoryConfig::default().with_max_messages(4);
        let mut messages = vec![
            ChatMessage::system("a"),
            ChatMessage::user("u1"),
            ChatMessage::system("b"),
            ChatMessage::user("u2"),
            ChatMessage::assistant("a2"),
        ];

        config.prune(&mut messages);
        assert_eq!(
            messages,
            vec![
                ChatMessage::system("a"),
                ChatMessage::system("b"),
                ChatMessage::user("u2"),
                ChatMessage::assistant("a2"),
            ]
        );
    }

    #[test]
    fn test_system_messages_alone_exceed_limit() {
        let config = HistoryConfig::default().with_max_messages(2);
        let mut messages = vec![
            ChatMessage::system("a"),
            ChatMessage::system("b"),
            ChatMessage::system("c"),
            ChatMessage::user("u"),
        ];

        config.prune(&mut messages);
        assert!(messages.iter().all(ChatMessage::is_pinned));
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn test_bound_holds_for_any_append_sequence() {
        let config = HistoryConfig::default();
        let mut messages = vec![ChatMessage::system("pinned-1")];
        for i in 0..200 {
            let msg = if i == 50 {
                ChatMessage::system("pinned-2")
            } else if i % 2 == 0 {
                ChatMessage::user(format!("u{i}"))
            } else {
                ChatMessage::assistant(format!("a{i}"))
            };
            messages.push(msg);
            config.prune(&mut messages);

            assert!(messages.len() <= config.max_messages);
            assert!(messages.contains(&ChatMessage::system("pinned-1")));
            if i >= 50 {
                assert!(messages.contains(&ChatMessage::system("pinned-2")));
            }
        }
    }

    #[test]
    fn test_history_stats() {
        let mut messages = vec![ChatMessage::system("be brief")];
        messages.extend(create_test_messages(10));

        let stats = HistoryStats::of(&messages);

        assert_eq!(stats.total_messages, 11);
        assert_eq!(stats.system_messages, 1);
        assert_eq!(stats.user_messages, 5);
        assert_eq!(stats.assistant_messages, 5);
        assert!(stats.estimated_tokens > 0);
    }
}
