//! Built-in artist tools

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;
use uuid::Uuid;

use super::tools::{ToolContext, ToolDefinition, ToolEffect, ToolError, ToolExecutor, ToolSource};
use crate::repositories::{DynChatStore, StorageError};

pub const CREATE_ARTIST: &str = "create_artist";
pub const GET_ARTIST_PROFILE: &str = "get_artist_profile";

const MAX_ARTIST_NAME_LENGTH: usize = 120;

fn storage_failure(error: StorageError) -> ToolError {
    match error {
        StorageError::Database(sqlx::Error::PoolTimedOut)
        | StorageError::Database(sqlx::Error::PoolClosed)
        | StorageError::Database(sqlx::Error::Io(_)) => ToolError::Unavailable(error.to_string()),
        other => ToolError::Failed(other.to_string()),
    }
}

#[derive(Deserialize)]
struct CreateArtistArgs {
    name: String,
}

struct CreateArtist {
    store: DynChatStore,
}

#[async_trait]
impl ToolExecutor for CreateArtist {
    #[instrument(skip(self, arguments), fields(account_id = %context.account_id))]
    async fn execute(&self, context: &ToolContext, arguments: Value) -> Result<Value, ToolError> {
        let args: CreateArtistArgs = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let name = args.name.trim();
        if name.is_empty() || name.len() > MAX_ARTIST_NAME_LENGTH {
            return Err(ToolError::InvalidArguments(format!(
                "artist name must be 1 to {} characters",
                MAX_ARTIST_NAME_LENGTH
            )));
        }

        let artist = self
            .store
            .create_artist(context.account_id, name)
            .await
            .map_err(storage_failure)?;

        Ok(json!({
            "artist": {"id": artist.id, "name": artist.name},
            "message": format!("Created artist {}", artist.name),
        }))
    }
}

#[derive(Deserialize)]
struct GetArtistProfileArgs {
    artist_id: Uuid,
}

struct GetArtistProfile {
    store: DynChatStore,
}

#[async_trait]
impl ToolExecutor for GetArtistProfile {
    async fn execute(&self, context: &ToolContext, arguments: Value) -> Result<Value, ToolError> {
        let args: GetArtistProfileArgs = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;

        let artist = self
            .store
            .get_artist(args.artist_id)
            .await
            .map_err(storage_failure)?
            .filter(|artist| artist.account_id == context.account_id)
            .ok_or_else(|| ToolError::Failed(format!("artist not found: {}", args.artist_id)))?;

        Ok(json!({
            "artist": {
                "id": artist.id,
                "name": artist.name,
                "createdAt": artist.created_at,
            }
        }))
    }
}

/// Artist management tools backed by the chat store
pub struct ArtistToolSource {
    store: DynChatStore,
}

impl ArtistToolSource {
    pub fn new(store: DynChatStore) -> Self {
        Self { store }
    }
}

impl ToolSource for ArtistToolSource {
    fn name(&self) -> &str {
        "artists"
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: CREATE_ARTIST.to_string(),
                description: "Create a new artist managed by the current account. \
                              The conversation moves to a room bound to the new artist."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "name": {"type": "string", "description": "Artist or band name"}
                    },
                    "required": ["name"]
                }),
                effect: ToolEffect::CreatesArtist,
                executor: Arc::new(CreateArtist {
                    store: Arc::clone(&self.store),
                }),
            },
            ToolDefinition {
                name: GET_ARTIST_PROFILE.to_string(),
                description: "Look up the profile of an artist managed by the current account."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "artist_id": {"type": "string", "description": "Artist id (UUID)"}
                    },
                    "required": ["artist_id"]
                }),
                effect: ToolEffect::None,
                executor: Arc::new(GetArtistProfile {
                    store: Arc::clone(&self.store),
                }),
            },
        ]
    }
}

/// Id of the artist a successful `create_artist` call produced
pub fn created_artist_id(payload: &Value) -> Option<Uuid> {
    payload
        .get("artist")
        .and_then(|artist| artist.get("id"))
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
}
