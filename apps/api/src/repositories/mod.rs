//! Storage layer for Encore
//!
//! [`ChatStore`] is the storage capability the chat pipeline depends on.
//! Two implementations exist:
//! - [`ChatRepository`]: PostgreSQL through sqlx
//! - [`MemoryChatStore`]: process-local, for development and tests
//!
//! Single operations are atomic. The composite operations
//! ([`ChatStore::replace_messages`], [`ChatStore::create_room_with_messages`])
//! default to sequential calls of the primitives; implementations that can
//! do better override them with a transaction.

pub mod chat;
pub mod knowledge;
pub mod memory;

pub use chat::ChatRepository;
pub use knowledge::KnowledgeRepository;
pub use memory::MemoryChatStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Artist, Message, NewRoom, Room};

/// Storage failures
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database query failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("room not found: {0}")]
    RoomNotFound(Uuid),

    #[error("artist not found: {0}")]
    ArtistNotFound(Uuid),

    /// Non-database backend failure
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Shared handle to a chat store
pub type DynChatStore = Arc<dyn ChatStore>;

/// Room, message and artist persistence
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn get_room(&self, room_id: Uuid) -> StorageResult<Option<Room>>;

    /// Create a room. Creating an id that already exists returns the stored
    /// room unchanged.
    async fn create_room(&self, room: NewRoom) -> StorageResult<Room>;

    /// Rooms owned by an account, most recently updated first
    async fn list_rooms(&self, account_id: Uuid) -> StorageResult<Vec<Room>>;

    async fn update_topic(&self, room_id: Uuid, topic: &str) -> StorageResult<Room>;

    async fn update_artist(&self, room_id: Uuid, artist_id: Option<Uuid>) -> StorageResult<Room>;

    /// Delete a room and, by cascade, its messages
    async fn delete_room(&self, room_id: Uuid) -> StorageResult<bool>;

    /// Delete every message of a room, returning how many were removed
    async fn delete_messages(&self, room_id: Uuid) -> StorageResult<u64>;

    /// Append messages to a room, keeping their order
    async fn insert_messages(&self, room_id: Uuid, messages: &[Message]) -> StorageResult<()>;

    /// Messages of a room in persisted order
    async fn get_messages(&self, room_id: Uuid) -> StorageResult<Vec<Message>>;

    async fn create_artist(&self, account_id: Uuid, name: &str) -> StorageResult<Artist>;

    async fn get_artist(&self, artist_id: Uuid) -> StorageResult<Option<Artist>>;

    /// Replace the full history of a room
    async fn replace_messages(&self, room_id: Uuid, messages: &[Message]) -> StorageResult<()> {
        self.delete_messages(room_id).await?;
        self.insert_messages(room_id, messages).await
    }

    /// Create a room together with its initial history
    async fn create_room_with_messages(
        &self,
        room: NewRoom,
        messages: &[Message],
    ) -> StorageResult<Room> {
        let created = self.create_room(room).await?;
        self.insert_messages(created.id, messages).await?;
        Ok(created)
    }
}
