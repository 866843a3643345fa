//! Room (persisted conversation) models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Topic used when the first message has no usable words
pub const DEFAULT_TOPIC: &str = "New conversation";

/// Number of words of the first message kept as the topic
const TOPIC_WORDS: usize = 5;

/// Room record from the rooms table
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// Client-minted room identifier
    pub id: Uuid,

    /// Account that owns the room
    pub account_id: Uuid,

    /// Artist context bound to the room, if any
    pub artist_id: Option<Uuid>,

    /// Display title
    pub topic: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a room
#[derive(Debug, Clone, Deserialize)]
pub struct NewRoom {
    pub id: Uuid,
    pub account_id: Uuid,
    pub artist_id: Option<Uuid>,
    pub topic: String,
}

impl NewRoom {
    pub fn into_room(self) -> Room {
        let now = Utc::now();
        Room {
            id: self.id,
            account_id: self.account_id,
            artist_id: self.artist_id,
            topic: self.topic,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derive a room topic from the first words of the opening message
pub fn topic_from_message(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().take(TOPIC_WORDS).collect();
    if words.is_empty() {
        DEFAULT_TOPIC.to_string()
    } else {
        words.join(" ")
    }
}
