//! Conversation persistence after a turn
//!
//! The complete conversation of a turn is the client's history followed by
//! the assistant messages generated during the turn. Persisting it is
//! idempotent: the first turn of a room creates the room, every later turn
//! replaces the stored history wholesale. Work on one room is serialized by
//! [`RoomLocks`]; different rooms proceed in parallel.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{Message, NewRoom, Room};
use crate::repositories::{DynChatStore, StorageError};

/// Per-room async mutexes, dropped once nobody holds or waits on them
#[derive(Clone, Default)]
pub struct RoomLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, room_id: Uuid) -> RoomGuard {
        let mutex = self
            .locks
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        RoomGuard {
            room_id,
            guard: Some(mutex.lock_owned().await),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Rooms with a live lock entry
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one room
pub struct RoomGuard {
    room_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Drop for RoomGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.room_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Room attributes used when a turn creates its room
#[derive(Debug, Clone)]
pub struct RoomDraft {
    pub room_id: Uuid,
    pub account_id: Uuid,
    pub artist_id: Option<Uuid>,
    pub topic: String,
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The stored room is owned by an account other than the turn's
    #[error("room {0} belongs to another account")]
    ForeignRoom(Uuid),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Created(Room),
    Replaced { message_count: usize },
}

/// Client history followed by generated messages, first occurrence of each
/// id kept
pub fn complete_conversation(history: &[Message], generated: &[Message]) -> Vec<Message> {
    let mut seen = HashSet::with_capacity(history.len() + generated.len());
    history
        .iter()
        .chain(generated)
        .filter(|message| seen.insert(message.id))
        .cloned()
        .collect()
}

pub struct ConversationReconciler {
    store: DynChatStore,
    locks: RoomLocks,
}

impl ConversationReconciler {
    pub fn new(store: DynChatStore, locks: RoomLocks) -> Self {
        Self { store, locks }
    }

    /// Persist the complete conversation of a turn
    #[instrument(skip(self, draft, history, generated), fields(room_id = %draft.room_id))]
    pub async fn reconcile(
        &self,
        draft: &RoomDraft,
        history: &[Message],
        generated: &[Message],
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let conversation = complete_conversation(history, generated);
        let _guard = self.locks.lock(draft.room_id).await;

        match self.store.get_room(draft.room_id).await? {
            None => {
                let room = self
                    .store
                    .create_room_with_messages(
                        NewRoom {
                            id: draft.room_id,
                            account_id: draft.account_id,
                            artist_id: draft.artist_id,
                            topic: draft.topic.clone(),
                        },
                        &conversation,
                    )
                    .await?;
                info!(message_count = conversation.len(), "Created room");
                Ok(ReconcileOutcome::Created(room))
            }
            Some(room) if room.account_id != draft.account_id => {
                warn!(
                    owner = %room.account_id,
                    account_id = %draft.account_id,
                    "Refusing to replace history of a room owned by another account"
                );
                Err(ReconcileError::ForeignRoom(draft.room_id))
            }
            Some(_) => {
                self.store
                    .replace_messages(draft.room_id, &conversation)
                    .await?;
                info!(message_count = conversation.len(), "Replaced room history");
                Ok(ReconcileOutcome::Replaced {
                    message_count: conversation.len(),
                })
            }
        }
    }
}
