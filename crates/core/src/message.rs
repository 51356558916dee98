//! Message and Conversation domain types.
//!
//! A conversation is append-only during a run: the step loop pushes one
//! assistant message per step followed by exactly one tool message per
//! tool call it carried.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::tool::ToolCall;

/// Unique identifier for a conversation (chat thread).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instruction
    System,
    /// The end user
    User,
    /// The model
    Assistant,
    /// Tool execution result
    Tool,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Set on tool messages that carry an error instead of output
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content.into());
        msg.tool_calls = tool_calls;
        msg
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Create a tool result message that reports a failure.
    pub fn tool_error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::tool_result(tool_call_id, content);
        msg.is_error = true;
        msg
    }
}

/// A conversation is an ordered sequence of messages with shared context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: ConversationId,

    /// Ordered messages
    pub messages: Vec<Message>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last message was added
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new empty conversation.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a message to the conversation.
    pub fn push(&mut self, message: Message) {
        self.updated_at = Utc::now();
        self.messages.push(message);
    }

    /// Append a batch of messages in order.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.updated_at = Utc::now();
        self.messages.extend(messages);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// The leading system message, if the conversation was seeded with one.
    pub fn system_instruction(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// The most recent assistant message.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// IDs of tool calls that have no matching tool message yet.
    ///
    /// An empty result means the conversation is safe to send to a model.
    pub fn unresolved_tool_calls(&self) -> Vec<String> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();

        self.messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|call| !answered.contains(call.id.as_str()))
            .map(|call| call.id.clone())
            .collect()
    }

    /// Messages to show the model, optionally bounded to the last `keep_last`.
    ///
    /// The leading system message is never part of the window (it travels
    /// separately). The window is widened backwards so it never starts on a
    /// tool message whose assistant call was cut off.
    pub fn window(&self, keep_last: Option<usize>) -> Vec<Message> {
        let body = match self.system_instruction() {
            Some(_) => &self.messages[1..],
            None => &self.messages[..],
        };

        let Some(keep) = keep_last else {
            return body.to_vec();
        };
        if keep == 0 {
            return Vec::new();
        }

        let mut start = body.len().saturating_sub(keep);
        while start > 0 && body[start].role == Role::Tool {
            start -= 1;
        }
        body[start..].to_vec()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "lookup", json!({}))
    }

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, agent!");
        assert!(msg.tool_calls.is_empty());
        assert!(!msg.is_error);
    }

    #[test]
    fn conversation_tracks_updates() {
        let mut conv = Conversation::new();
        let created = conv.created_at;

        conv.push(Message::user("First message"));
        assert_eq!(conv.len(), 1);
        assert!(conv.updated_at >= created);
    }

    #[test]
    fn tool_error_is_flagged() {
        let msg = Message::tool_error("call_1", "boom");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(msg.is_error);
    }

    #[test]
    fn unresolved_calls_are_reported() {
        let mut conv = Conversation::new();
        conv.push(Message::user("hi"));
        conv.push(Message::assistant_with_calls("", vec![call("a"), call("b")]));
        conv.push(Message::tool_result("a", "ok"));

        assert_eq!(conv.unresolved_tool_calls(), vec!["b".to_string()]);

        conv.push(Message::tool_result("b", "ok"));
        assert!(conv.unresolved_tool_calls().is_empty());
    }

    #[test]
    fn window_skips_system_message() {
        let mut conv = Conversation::new();
        conv.push(Message::system("be brief"));
        conv.push(Message::user("hi"));

        assert_eq!(conv.system_instruction(), Some("be brief"));
        let window = conv.window(None);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].role, Role::User);
    }

    #[test]
    fn zero_window_is_empty() {
        let mut conv = Conversation::new();
        conv.push(Message::user("q"));
        assert!(conv.window(Some(0)).is_empty());
    }

    #[test]
    fn window_never_starts_on_orphaned_tool_message() {
        let mut conv = Conversation::new();
        conv.push(Message::user("q"));
        conv.push(Message::assistant_with_calls("", vec![call("a"), call("b")]));
        conv.push(Message::tool_result("a", "1"));
        conv.push(Message::tool_result("b", "2"));

        // Keeping 1 would start on tool "b"; the window must widen to the
        // assistant message that issued it.
        let window = conv.window(Some(1));
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].role, Role::Assistant);
    }

    #[test]
    fn message_serialization_roundtrip() {
        let msg = Message::assistant_with_calls("thinking", vec![call("x")]);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_calls.len(), 1);
        assert_eq!(back.tool_calls[0].id, "x");
        assert!(!json.contains("is_error"));
    }
}
