//! Component C: the context manager.
//!
//! An append-only conversation log with role tags, token counting, and
//! windowed retrieval. Shaped like the message/role types in `traits.rs`
//! (`Message`, `MessageRole`) elsewhere in this codebase, generalized into a
//! standalone log rather than a one-shot request payload.

use serde::{Deserialize, Serialize};

use crate::error::{ContextError, ContextResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
    /// Pinned messages survive compaction.
    pub pinned: bool,
}

/// A pluggable token-counting strategy. The core only requires that, after
/// compaction, total tokens fall below `max_context_tokens -
/// compaction_buffer`; the policy for counting and summarising is pluggable.
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &str;
    fn count(&self, text: &str) -> u32;
}

/// Whitespace-based approximate tokenizer, used as the default and in
/// tests. Production deployments supply a real tokenizer for the model in
/// use; the context manager is agnostic to which.
pub struct ApproxTokenizer {
    model: String,
}

impl ApproxTokenizer {
    pub fn new(model: impl Into<String>) -> Self {
        Self { model: model.into() }
    }
}

impl Tokenizer for ApproxTokenizer {
    fn name(&self) -> &str {
        &self.model
    }

    fn count(&self, text: &str) -> u32 {
        // Whitespace-token approximation; good enough for budget math, not
        // for exact provider billing.
        text.split_whitespace().count() as u32
    }
}

pub struct ContextManager {
    messages: Vec<ContextMessage>,
    tokenizer: Box<dyn Tokenizer>,
}

impl ContextManager {
    pub fn new(tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            messages: Vec::new(),
            tokenizer,
        }
    }

    /// Appends a message. Empty-content messages are dropped on write.
    pub fn append(&mut self, role: Role, content: impl Into<String>, timestamp: i64) {
        let content = content.into();
        if content.is_empty() {
            return;
        }
        self.messages.push(ContextMessage {
            role,
            content,
            timestamp,
            pinned: false,
        });
    }

    pub fn append_pinned(&mut self, role: Role, content: impl Into<String>, timestamp: i64) {
        let content = content.into();
        if content.is_empty() {
            return;
        }
        self.messages.push(ContextMessage {
            role,
            content,
            timestamp,
            pinned: true,
        });
    }

    pub fn get_messages(&self) -> &[ContextMessage] {
        &self.messages
    }

    pub fn count_tokens(&self) -> u32 {
        self.messages
            .iter()
            .map(|m| self.tokenizer.count(&m.content))
            .sum()
    }

    /// Walks backwards from the most recent message and returns the suffix
    /// whose token sum is ≤ `token_limit`, truncating the oldest included
    /// message if necessary so at least one message is returned.
    pub fn get_window(&self, token_limit: u32) -> Vec<ContextMessage> {
        if self.messages.is_empty() {
            return Vec::new();
        }

        let mut window = Vec::new();
        let mut total: u32 = 0;

        for msg in self.messages.iter().rev() {
            let tokens = self.tokenizer.count(&msg.content);
            if total + tokens > token_limit && !window.is_empty() {
                break;
            }
            total += tokens;
            window.push(msg.clone());
        }

        window.reverse();
        window
    }

    /// When the context exceeds `max_context_tokens - compaction_buffer`,
    /// older non-pinned messages are summarised and replaced by a single
    /// summary message. `summarize` receives the messages being dropped and
    /// returns the replacement summary text.
    pub fn compact_if_needed(
        &mut self,
        max_context_tokens: u32,
        compaction_buffer: u32,
        now: i64,
        summarize: impl FnOnce(&[ContextMessage]) -> String,
    ) -> ContextResult<bool> {
        let limit = max_context_tokens.saturating_sub(compaction_buffer);
        if self.count_tokens() <= limit {
            return Ok(false);
        }

        let split = self
            .messages
            .iter()
            .position(|m| m.pinned)
            .unwrap_or(self.messages.len());

        // Drop the oldest half of the non-pinned prefix, replacing it with a
        // summary, until we're under the limit or nothing is left to drop.
        let mut dropped_end = 0;
        while self.count_tokens() > limit && dropped_end < split {
            dropped_end += 1;
            let dropped = &self.messages[..dropped_end];
            let summary = summarize(dropped);
            let summary_tokens = self.tokenizer.count(&summary);
            let remaining_tokens: u32 = self.messages[dropped_end..]
                .iter()
                .map(|m| self.tokenizer.count(&m.content))
                .sum();
            if summary_tokens + remaining_tokens <= limit {
                let mut rest = self.messages.split_off(dropped_end);
                self.messages.clear();
                self.messages.push(ContextMessage {
                    role: Role::System,
                    content: summary,
                    timestamp: now,
                    pinned: false,
                });
                self.messages.append(&mut rest);
                return Ok(true);
            }
        }

        if self.count_tokens() > limit {
            return Err(ContextError::CompactionFailed(
                "could not reduce context below limit even after compacting all non-pinned messages".into(),
            ));
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr() -> ContextManager {
        ContextManager::new(Box::new(ApproxTokenizer::new("cl100k_base")))
    }

    #[test]
    fn empty_content_is_dropped() {
        let mut c = mgr();
        c.append(Role::User, "", 1);
        assert_eq!(c.get_messages().len(), 0);
    }

    #[test]
    fn window_walks_backward_and_always_returns_at_least_one() {
        let mut c = mgr();
        c.append(Role::User, "one two three", 1);
        c.append(Role::Assistant, "four five", 2);
        c.append(Role::User, "six seven eight nine", 3);

        let window = c.get_window(3);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "six seven eight nine");
    }

    #[test]
    fn window_includes_as_many_recent_messages_as_fit() {
        let mut c = mgr();
        c.append(Role::User, "a b", 1);
        c.append(Role::Assistant, "c d", 2);
        c.append(Role::User, "e f", 3);

        let window = c.get_window(4);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].content, "c d");
        assert_eq!(window[1].content, "e f");
    }

    #[test]
    fn compaction_replaces_oldest_messages_with_a_summary() {
        let mut c = mgr();
        for i in 0..50 {
            c.append(Role::User, format!("message number {i} with some words"), i);
        }
        let before = c.count_tokens();
        let compacted = c
            .compact_if_needed(100, 20, 999, |dropped| {
                format!("summary of {} messages", dropped.len())
            })
            .unwrap();
        assert!(compacted);
        assert!(c.count_tokens() < before);
        assert!(c.count_tokens() <= 80);
    }

    #[test]
    fn compaction_is_noop_under_limit() {
        let mut c = mgr();
        c.append(Role::User, "short", 1);
        let compacted = c.compact_if_needed(1000, 100, 2, |_| "summary".into()).unwrap();
        assert!(!compacted);
    }
}
