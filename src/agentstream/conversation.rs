//! Stateless message-history utilities consumed by agents.
//!
//! [`prepare_for_llm`] bounds a turn's history before it is sent upstream:
//! system messages are always preserved, the conversation is trimmed to the
//! most recent `max_messages`, and then further trimmed from the front until
//! the estimated token count fits `max_tokens`. Token counting is the usual
//! approximation of one token per four characters — exactness is a
//! non-goal; the bound only has to keep requests under provider limits.

use crate::agentstream::event::{ChatMessage, ChatRole};

/// Trimming bounds for [`prepare_for_llm`].
#[derive(Debug, Clone)]
pub struct PrepareConfig {
    /// Keep at most this many conversation messages (system messages are
    /// exempt). Default: 30.
    pub max_messages: usize,
    /// Estimated token budget for the prepared sequence. Default: 8000.
    pub max_tokens: usize,
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            max_messages: 30,
            max_tokens: 8000,
        }
    }
}

/// Estimate tokens in `text`: one token per 4 characters, minimum 1.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

fn message_tokens(message: &ChatMessage) -> usize {
    // The role annotation costs roughly one token.
    1 + estimate_tokens(&message.content)
}

/// Bound a history for an upstream request.
///
/// System messages survive both trims and are placed ahead of the
/// retained conversation tail.
pub fn prepare_for_llm(history: &[ChatMessage], config: &PrepareConfig) -> Vec<ChatMessage> {
    let system: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .collect();
    let conversation: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .collect();

    // Tail-trim by message count first.
    let start = conversation.len().saturating_sub(config.max_messages);
    let mut kept: Vec<&ChatMessage> = conversation[start..].to_vec();

    // Then tail-trim by estimated tokens, never dropping system messages.
    let system_tokens: usize = system.iter().map(|m| message_tokens(m)).sum();
    let mut total: usize = system_tokens + kept.iter().map(|m| message_tokens(m)).sum::<usize>();
    while total > config.max_tokens && !kept.is_empty() {
        let removed = kept.remove(0);
        total -= message_tokens(removed);
    }

    let mut prepared: Vec<ChatMessage> = system.into_iter().cloned().collect();
    prepared.extend(kept.into_iter().cloned());
    prepared
}

/// Flatten the last `n` conversation turns into a plain-text block.
pub fn format_as_context(history: &[ChatMessage], n: usize) -> String {
    let conversation: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .collect();
    let start = conversation.len().saturating_sub(n);
    conversation[start..]
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Most recent user message, if any.
pub fn last_user_message(history: &[ChatMessage]) -> Option<&ChatMessage> {
    history.iter().rev().find(|m| m.role == ChatRole::User)
}

/// Most recent assistant message, if any.
pub fn last_assistant_message(history: &[ChatMessage]) -> Option<&ChatMessage> {
    history.iter().rev().find(|m| m.role == ChatRole::Assistant)
}

/// Drop repeated message ids, keeping the first occurrence of each.
pub fn deduplicate_by_id(history: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut seen = std::collections::HashSet::new();
    history
        .iter()
        .filter(|m| seen.insert(m.id.clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, role: ChatRole, content: &str) -> ChatMessage {
        ChatMessage::new(id, role, content)
    }

    #[test]
    fn trims_to_max_messages_from_tail() {
        let history: Vec<ChatMessage> = (0..40)
            .map(|i| msg(&format!("m{}", i), ChatRole::User, "hello"))
            .collect();
        let prepared = prepare_for_llm(&history, &PrepareConfig::default());
        assert_eq!(prepared.len(), 30);
        assert_eq!(prepared[0].id, "m10");
        assert_eq!(prepared.last().unwrap().id, "m39");
    }

    #[test]
    fn preserves_system_messages_through_both_trims() {
        let mut history = vec![msg("sys", ChatRole::System, "be terse")];
        for i in 0..50 {
            history.push(msg(&format!("m{}", i), ChatRole::User, &"x".repeat(400)));
        }
        let config = PrepareConfig {
            max_messages: 30,
            max_tokens: 500,
        };
        let prepared = prepare_for_llm(&history, &config);
        assert_eq!(prepared[0].role, ChatRole::System);
        // 500 tokens at ~101 per message leaves the system prompt plus a
        // few tail messages.
        assert!(prepared.len() > 1);
        assert!(prepared.len() < 10);
        assert_eq!(prepared.last().unwrap().id, "m49");
    }

    #[test]
    fn format_as_context_takes_the_tail() {
        let history = vec![
            msg("m1", ChatRole::User, "first"),
            msg("m2", ChatRole::Assistant, "second"),
            msg("m3", ChatRole::User, "third"),
        ];
        let context = format_as_context(&history, 2);
        assert!(!context.contains("first"));
        assert!(context.contains("assistant: second"));
        assert!(context.contains("user: third"));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let history = vec![
            msg("a", ChatRole::User, "one"),
            msg("a", ChatRole::User, "two"),
            msg("b", ChatRole::User, "three"),
        ];
        let deduped = deduplicate_by_id(&history);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].content, "one");
    }

    #[test]
    fn last_message_helpers() {
        let history = vec![
            msg("m1", ChatRole::User, "question"),
            msg("m2", ChatRole::Assistant, "answer"),
        ];
        assert_eq!(last_user_message(&history).unwrap().id, "m1");
        assert_eq!(last_assistant_message(&history).unwrap().id, "m2");
    }
}
