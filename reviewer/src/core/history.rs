//! Conversation history with bounded growth.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
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

/// Number of leading messages that are never pruned (system + task framing).
const ANCHOR_MESSAGES: usize = 2;

/// Ordered, role-tagged message history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// Start a conversation from its two permanent anchors.
    pub fn new(system: impl Into<String>, initial_user: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system), Message::user(initial_user)],
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop the middle of the history once it exceeds `max_messages`.
    ///
    /// Keeps the anchor pair and at most `keep_recent` recent messages. The
    /// kept tail never opens with a user message, so the anchor's user turn is
    /// always answered by an assistant turn; an odd `keep_recent` keeps one
    /// message fewer. Returns the number of messages dropped.
    pub fn prune(&mut self, max_messages: usize, keep_recent: usize) -> usize {
        if self.messages.len() <= max_messages {
            return 0;
        }
        let anchors = ANCHOR_MESSAGES.min(self.messages.len());
        let mut tail_start = self.messages.len().saturating_sub(keep_recent).max(anchors);
        if tail_start > anchors
            && self
                .messages
                .get(tail_start)
                .is_some_and(|m| m.role == Role::User)
        {
            tail_start += 1;
        }
        let dropped = tail_start - anchors;
        self.messages.drain(anchors..tail_start);
        dropped
    }
}
