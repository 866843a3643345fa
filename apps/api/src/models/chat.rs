//! Chat message models
//!
//! A message's content is either plain text or an ordered list of parts.
//! Tool invocations never live on their own: they are folded into the
//! assistant message that triggered them as `tool-invocation` parts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Message role enum matching the PostgreSQL role column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    /// Returns the string representation of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of a tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ToolResultState {
    Pending,
    Success { payload: Value },
    Error { reason: String },
}

impl ToolResultState {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A tool call made during an assistant turn, with its result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
    pub result: ToolResultState,
}

/// One structured piece of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInvocation {
        tool_invocation: ToolInvocation,
    },
}

/// Message body: plain text or ordered parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessagePart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of the message, ignoring tool parts
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    MessagePart::Text { text } => Some(text.as_str()),
                    MessagePart::ToolInvocation { .. } => None,
                })
                .collect(),
        }
    }

    /// Tool invocations in the order they were made
    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        let parts: &[MessagePart] = match self {
            Self::Text(_) => &[],
            Self::Parts(parts) => parts,
        };
        parts.iter().filter_map(|part| match part {
            MessagePart::ToolInvocation { tool_invocation } => Some(tool_invocation),
            MessagePart::Text { .. } => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

/// A chat message as exchanged with clients and persisted per room
///
/// The id is proposed by whoever creates the message (usually the client)
/// and is never rewritten by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub role: MessageRole,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a plain text message with a fresh id
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), role, MessageContent::Text(text.into()))
    }

    pub fn with_id(id: Uuid, role: MessageRole, content: MessageContent) -> Self {
        Self {
            id,
            role,
            content,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(MessageRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(MessageRole::Assistant, text)
    }
}

/// Row of the room_messages table
#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub room_id: Uuid,
    pub position: i32,
    pub role: MessageRole,
    pub content: sqlx::types::Json<MessageContent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            role: row.role,
            content: row.content.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
