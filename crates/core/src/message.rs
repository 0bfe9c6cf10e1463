//! Message and transcript domain types.
//!
//! A [`MessageLog`] is the whole state threaded through one run: it is the
//! transcript returned to the caller and the exact history replayed to the
//! primary model on every generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix that marks a user-role message as critic feedback.
pub const FEEDBACK_PREFIX: &str = "FEEDBACK: ";

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user, or the critic speaking on the user's behalf
    User,
    /// The primary model
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single turn in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Wrap critique text as a user-role feedback message.
    pub fn feedback(critique: &str) -> Self {
        Self::user(format!("{FEEDBACK_PREFIX}{critique}"))
    }

    /// Whether this is a critic feedback message.
    pub fn is_feedback(&self) -> bool {
        self.role == Role::User && self.content.starts_with(FEEDBACK_PREFIX)
    }
}

/// Ordered, append-only transcript of one run.
///
/// Messages can be read but never modified or removed once pushed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a log with the system prompt followed by the user's query.
    pub fn seeded(system_prompt: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt), Message::user(query)],
        }
    }

    /// Append a message.
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

    /// The most recent message, if any.
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Number of assistant replies so far.
    pub fn assistant_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count()
    }

    /// The most recent assistant reply.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// The user's query: the first user message that is not feedback.
    pub fn original_query(&self) -> Option<&Message> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User && !m.is_feedback())
    }

    /// The latest assistant reply together with the closest user message
    /// before it. `None` unless both exist.
    pub fn latest_exchange(&self) -> Option<(&Message, &Message)> {
        let reply_idx = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)?;
        let prompt = self.messages[..reply_idx]
            .iter()
            .rev()
            .find(|m| m.role == Role::User)?;
        Some((prompt, &self.messages[reply_idx]))
    }

    /// Consume the log, returning the transcript.
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}
