//! Room to artist binding
//!
//! A persisted room keeps the artist it was created with. A turn that
//! selects a different artist does not rebind the room; the mismatch is
//! reported so the client can open a room for the selected artist instead.
//! Rebinding happens only through an explicit request, and never while a
//! turn for the room is streaming.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use super::reconciler::RoomLocks;
use crate::models::{NewRoom, Room};
use crate::repositories::{DynChatStore, StorageError};

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("a turn is streaming in room {0}")]
    TurnInFlight(Uuid),

    #[error("room not found: {0}")]
    RoomNotFound(Uuid),

    #[error("artist not found: {0}")]
    ArtistNotFound(Uuid),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The artist a turn runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub artist_id: Option<Uuid>,
    /// The caller selected an artist other than the one the room is bound to
    pub binding_changed: bool,
    pub room_exists: bool,
    /// Account owning the persisted room
    pub owner_id: Option<Uuid>,
}

/// Rooms with a turn currently streaming
#[derive(Clone, Default)]
pub struct InFlightTurns {
    rooms: Arc<DashMap<Uuid, usize>>,
}

impl InFlightTurns {
    pub fn begin(&self, room_id: Uuid) -> TurnGuard {
        *self.rooms.entry(room_id).or_insert(0) += 1;
        TurnGuard {
            room_id,
            rooms: Arc::clone(&self.rooms),
        }
    }

    pub fn is_streaming(&self, room_id: Uuid) -> bool {
        self.rooms.contains_key(&room_id)
    }
}

/// Marks a room as streaming until dropped
pub struct TurnGuard {
    room_id: Uuid,
    rooms: Arc<DashMap<Uuid, usize>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.rooms.get_mut(&self.room_id) {
            *count = count.saturating_sub(1);
        }
        self.rooms.remove_if(&self.room_id, |_, count| *count == 0);
    }
}

pub struct RoomArtistBinder {
    store: DynChatStore,
    locks: RoomLocks,
    in_flight: InFlightTurns,
}

impl RoomArtistBinder {
    pub fn new(store: DynChatStore, locks: RoomLocks) -> Self {
        Self {
            store,
            locks,
            in_flight: InFlightTurns::default(),
        }
    }

    pub fn begin_turn(&self, room_id: Uuid) -> TurnGuard {
        self.in_flight.begin(room_id)
    }

    pub fn is_streaming(&self, room_id: Uuid) -> bool {
        self.in_flight.is_streaming(room_id)
    }

    /// Decide which artist a turn uses
    ///
    /// A persisted room always wins over the caller's selection. A room that
    /// does not exist yet takes the selection.
    pub async fn resolve_binding(
        &self,
        room_id: Uuid,
        selected_artist_id: Option<Uuid>,
    ) -> Result<Binding, BindingError> {
        let binding = match self.store.get_room(room_id).await? {
            Some(room) => Binding {
                artist_id: room.artist_id,
                binding_changed: selected_artist_id.is_some()
                    && selected_artist_id != room.artist_id,
                room_exists: true,
                owner_id: Some(room.account_id),
            },
            None => Binding {
                artist_id: selected_artist_id,
                binding_changed: false,
                room_exists: false,
                owner_id: None,
            },
        };
        Ok(binding)
    }

    /// Explicitly rebind a room to another artist, or to none
    #[instrument(skip(self))]
    pub async fn rebind(
        &self,
        room_id: Uuid,
        account_id: Uuid,
        artist_id: Option<Uuid>,
    ) -> Result<Room, BindingError> {
        if self.in_flight.is_streaming(room_id) {
            return Err(BindingError::TurnInFlight(room_id));
        }

        if let Some(artist_id) = artist_id {
            self.store
                .get_artist(artist_id)
                .await?
                .filter(|artist| artist.account_id == account_id)
                .ok_or(BindingError::ArtistNotFound(artist_id))?;
        }

        let _guard = self.locks.lock(room_id).await;
        if self.in_flight.is_streaming(room_id) {
            return Err(BindingError::TurnInFlight(room_id));
        }
        let room = self.store.update_artist(room_id, artist_id).await.map_err(|e| match e {
            StorageError::RoomNotFound(id) => BindingError::RoomNotFound(id),
            other => BindingError::Storage(other),
        })?;

        info!(artist_id = ?room.artist_id, "Room rebound");
        Ok(room)
    }

    /// Copy a room's history into a new room bound to `artist_id`
    ///
    /// The source room is left untouched.
    #[instrument(skip(self))]
    pub async fn fork(
        &self,
        source_room_id: Uuid,
        artist_id: Uuid,
        new_room_id: Uuid,
    ) -> Result<Room, BindingError> {
        let _guard = self.locks.lock(source_room_id).await;

        let source = self
            .store
            .get_room(source_room_id)
            .await?
            .ok_or(BindingError::RoomNotFound(source_room_id))?;
        let messages = self.store.get_messages(source_room_id).await?;

        let room = self
            .store
            .create_room_with_messages(
                NewRoom {
                    id: new_room_id,
                    account_id: source.account_id,
                    artist_id: Some(artist_id),
                    topic: source.topic.clone(),
                },
                &messages,
            )
            .await?;

        info!(message_count = messages.len(), "Forked room");
        Ok(room)
    }
}
