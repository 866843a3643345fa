//! PostgreSQL storage for rooms, messages and artists

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::{ChatStore, StorageError, StorageResult};
use crate::models::chat::MessageRow;
use crate::models::{Artist, Message, NewRoom, Room};

const ROOM_COLUMNS: &str = "id, account_id, artist_id, topic, created_at, updated_at";

/// Repository for chat database operations
///
/// Messages are stored in `room_messages` keyed by `(room_id, id)` with an
/// explicit `position`; ordering always comes from `position`, never from
/// timestamps.
#[derive(Clone)]
pub struct ChatRepository {
    pool: PgPool,
}

impl ChatRepository {
    /// Create a new ChatRepository instance
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert messages starting at `start_position` inside a transaction
    async fn insert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        room_id: Uuid,
        messages: &[Message],
        start_position: i32,
    ) -> StorageResult<()> {
        for (offset, message) in messages.iter().enumerate() {
            let position = start_position + offset as i32;
            sqlx::query(
                r#"
                INSERT INTO room_messages (room_id, id, position, role, content, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(room_id)
            .bind(message.id)
            .bind(position)
            .bind(message.role)
            .bind(sqlx::types::Json(&message.content))
            .bind(message.created_at)
            .bind(message.updated_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Lock the room row for the rest of the transaction
    async fn lock_room(tx: &mut Transaction<'_, Postgres>, room_id: Uuid) -> StorageResult<()> {
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM rooms WHERE id = $1 FOR UPDATE")
                .bind(room_id)
                .fetch_optional(&mut **tx)
                .await?;

        locked.map(|_| ()).ok_or(StorageError::RoomNotFound(room_id))
    }

    async fn insert_room(
        tx: &mut Transaction<'_, Postgres>,
        room: &NewRoom,
    ) -> StorageResult<Room> {
        let inserted = sqlx::query_as::<_, Room>(&format!(
            r#"
            INSERT INTO rooms (id, account_id, artist_id, topic)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            RETURNING {ROOM_COLUMNS}
            "#
        ))
        .bind(room.id)
        .bind(room.account_id)
        .bind(room.artist_id)
        .bind(&room.topic)
        .fetch_optional(&mut **tx)
        .await?;

        match inserted {
            Some(room) => Ok(room),
            None => sqlx::query_as::<_, Room>(&format!(
                "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"
            ))
            .bind(room.id)
            .fetch_one(&mut **tx)
            .await
            .map_err(StorageError::from),
        }
    }
}

#[async_trait]
impl ChatStore for ChatRepository {
    #[instrument(skip(self))]
    async fn get_room(&self, room_id: Uuid) -> StorageResult<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"
        ))
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(room)
    }

    #[instrument(skip(self, room), fields(room_id = %room.id))]
    async fn create_room(&self, room: NewRoom) -> StorageResult<Room> {
        let mut tx = self.pool.begin().await?;
        let created = Self::insert_room(&mut tx, &room).await?;
        tx.commit().await?;
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn list_rooms(&self, account_id: Uuid) -> StorageResult<Vec<Room>> {
        let rooms = sqlx::query_as::<_, Room>(&format!(
            r#"
            SELECT {ROOM_COLUMNS} FROM rooms
            WHERE account_id = $1
            ORDER BY updated_at DESC
            "#
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rooms)
    }

    #[instrument(skip(self, topic))]
    async fn update_topic(&self, room_id: Uuid, topic: &str) -> StorageResult<Room> {
        sqlx::query_as::<_, Room>(&format!(
            r#"
            UPDATE rooms SET topic = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {ROOM_COLUMNS}
            "#
        ))
        .bind(room_id)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::RoomNotFound(room_id))
    }

    #[instrument(skip(self))]
    async fn update_artist(&self, room_id: Uuid, artist_id: Option<Uuid>) -> StorageResult<Room> {
        sqlx::query_as::<_, Room>(&format!(
            r#"
            UPDATE rooms SET artist_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {ROOM_COLUMNS}
            "#
        ))
        .bind(room_id)
        .bind(artist_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::RoomNotFound(room_id))
    }

    #[instrument(skip(self))]
    async fn delete_room(&self, room_id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM rooms WHERE id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_messages(&self, room_id: Uuid) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM room_messages WHERE room_id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, messages), fields(count = messages.len()))]
    async fn insert_messages(&self, room_id: Uuid, messages: &[Message]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_room(&mut tx, room_id).await?;

        let (next_position,): (i32,) = sqlx::query_as(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM room_messages WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_one(&mut *tx)
        .await?;

        Self::insert_in_tx(&mut tx, room_id, messages, next_position).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_messages(&self, room_id: Uuid) -> StorageResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, room_id, position, role, content, created_at, updated_at
            FROM room_messages
            WHERE room_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Message::from).collect())
    }

    #[instrument(skip(self, name))]
    async fn create_artist(&self, account_id: Uuid, name: &str) -> StorageResult<Artist> {
        let artist = sqlx::query_as::<_, Artist>(
            r#"
            INSERT INTO artists (account_id, name)
            VALUES ($1, $2)
            RETURNING id, account_id, name, created_at
            "#,
        )
        .bind(account_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(artist)
    }

    #[instrument(skip(self))]
    async fn get_artist(&self, artist_id: Uuid) -> StorageResult<Option<Artist>> {
        let artist = sqlx::query_as::<_, Artist>(
            "SELECT id, account_id, name, created_at FROM artists WHERE id = $1",
        )
        .bind(artist_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(artist)
    }

    /// Delete-and-replace in one transaction, so a crash never leaves the
    /// room empty
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    async fn replace_messages(&self, room_id: Uuid, messages: &[Message]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_room(&mut tx, room_id).await?;

        sqlx::query("DELETE FROM room_messages WHERE room_id = $1")
            .bind(room_id)
            .execute(&mut *tx)
            .await?;

        Self::insert_in_tx(&mut tx, room_id, messages, 0).await?;

        sqlx::query("UPDATE rooms SET updated_at = NOW() WHERE id = $1")
            .bind(room_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, room, messages), fields(room_id = %room.id, count = messages.len()))]
    async fn create_room_with_messages(
        &self,
        room: NewRoom,
        messages: &[Message],
    ) -> StorageResult<Room> {
        let mut tx = self.pool.begin().await?;
        let created = Self::insert_room(&mut tx, &room).await?;
        Self::insert_in_tx(&mut tx, created.id, messages, 0).await?;
        tx.commit().await?;
        Ok(created)
    }
}
