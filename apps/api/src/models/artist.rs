//! Artist models

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// Artist record from the artists table
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artist {
    pub id: Uuid,

    /// Account that manages the artist
    pub account_id: Uuid,

    pub name: String,

    pub created_at: DateTime<Utc>,
}

/// A knowledge base document attached to an artist
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct KnowledgeEntry {
    pub name: String,

    /// MIME type of the content ("text/plain", "text/markdown", ...)
    pub mime_type: String,

    pub content: String,
}

impl KnowledgeEntry {
    /// MIME types whose content can be inlined into a prompt
    pub const TEXT_TYPES: [&'static str; 3] = ["text/plain", "text/markdown", "application/json"];

    pub fn is_textual(&self) -> bool {
        Self::TEXT_TYPES.contains(&self.mime_type.as_str())
    }
}
