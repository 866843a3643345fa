//! In-process storage used for local development and tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ChatStore, StorageError, StorageResult};
use crate::models::{Artist, KnowledgeEntry, Message, NewRoom, Room};
use crate::services::knowledge::KnowledgeSource;

#[derive(Default)]
struct MemoryState {
    rooms: HashMap<Uuid, Room>,
    messages: HashMap<Uuid, Vec<Message>>,
    artists: HashMap<Uuid, Artist>,
    knowledge: HashMap<Uuid, Vec<KnowledgeEntry>>,
}

/// [`ChatStore`] backed by a map behind an async lock
///
/// Every trait operation, composites included, runs under a single write
/// lock, so the store behaves transactionally. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryChatStore {
    state: Arc<RwLock<MemoryState>>,
    fail_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent room, message and artist read fail
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Attach a knowledge document to an artist
    pub async fn add_knowledge(&self, artist_id: Uuid, entry: KnowledgeEntry) {
        self.state
            .write()
            .await
            .knowledge
            .entry(artist_id)
            .or_default()
            .push(entry);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("writes are disabled".to_string()));
        }
        Ok(())
    }

    fn check_readable(&self) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("reads are disabled".to_string()));
        }
        Ok(())
    }

    fn touch(state: &mut MemoryState, room_id: Uuid) -> StorageResult<()> {
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or(StorageError::RoomNotFound(room_id))?;
        room.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn get_room(&self, room_id: Uuid) -> StorageResult<Option<Room>> {
        self.check_readable()?;
        Ok(self.state.read().await.rooms.get(&room_id).cloned())
    }

    async fn create_room(&self, room: NewRoom) -> StorageResult<Room> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let stored = state
            .rooms
            .entry(room.id)
            .or_insert_with(|| room.into_room())
            .clone();
        Ok(stored)
    }

    async fn list_rooms(&self, account_id: Uuid) -> StorageResult<Vec<Room>> {
        self.check_readable()?;
        let state = self.state.read().await;
        let mut rooms: Vec<Room> = state
            .rooms
            .values()
            .filter(|room| room.account_id == account_id)
            .cloned()
            .collect();
        rooms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rooms)
    }

    async fn update_topic(&self, room_id: Uuid, topic: &str) -> StorageResult<Room> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or(StorageError::RoomNotFound(room_id))?;
        room.topic = topic.to_string();
        room.updated_at = Utc::now();
        Ok(room.clone())
    }

    async fn update_artist(&self, room_id: Uuid, artist_id: Option<Uuid>) -> StorageResult<Room> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let room = state
            .rooms
            .get_mut(&room_id)
            .ok_or(StorageError::RoomNotFound(room_id))?;
        room.artist_id = artist_id;
        room.updated_at = Utc::now();
        Ok(room.clone())
    }

    async fn delete_room(&self, room_id: Uuid) -> StorageResult<bool> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        state.messages.remove(&room_id);
        Ok(state.rooms.remove(&room_id).is_some())
    }

    async fn delete_messages(&self, room_id: Uuid) -> StorageResult<u64> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        Ok(state
            .messages
            .remove(&room_id)
            .map(|removed| removed.len() as u64)
            .unwrap_or(0))
    }

    async fn insert_messages(&self, room_id: Uuid, messages: &[Message]) -> StorageResult<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        Self::touch(&mut *state, room_id)?;

        let stored = state.messages.entry(room_id).or_default();
        if let Some(dup) = messages
            .iter()
            .find(|m| stored.iter().any(|existing| existing.id == m.id))
        {
            return Err(StorageError::Backend(format!(
                "duplicate message id {} in room {}",
                dup.id, room_id
            )));
        }
        stored.extend_from_slice(messages);
        Ok(())
    }

    async fn get_messages(&self, room_id: Uuid) -> StorageResult<Vec<Message>> {
        self.check_readable()?;
        Ok(self
            .state
            .read()
            .await
            .messages
            .get(&room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_artist(&self, account_id: Uuid, name: &str) -> StorageResult<Artist> {
        self.check_writable()?;
        let artist = Artist {
            id: Uuid::new_v4(),
            account_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .artists
            .insert(artist.id, artist.clone());
        Ok(artist)
    }

    async fn get_artist(&self, artist_id: Uuid) -> StorageResult<Option<Artist>> {
        self.check_readable()?;
        Ok(self.state.read().await.artists.get(&artist_id).cloned())
    }

    async fn replace_messages(&self, room_id: Uuid, messages: &[Message]) -> StorageResult<()> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        Self::touch(&mut *state, room_id)?;
        state.messages.insert(room_id, messages.to_vec());
        Ok(())
    }

    async fn create_room_with_messages(
        &self,
        room: NewRoom,
        messages: &[Message],
    ) -> StorageResult<Room> {
        self.check_writable()?;
        let mut state = self.state.write().await;
        let room_id = room.id;
        let stored = state
            .rooms
            .entry(room_id)
            .or_insert_with(|| room.into_room())
            .clone();
        state
            .messages
            .entry(room_id)
            .or_default()
            .extend_from_slice(messages);
        Ok(stored)
    }
}

#[async_trait]
impl KnowledgeSource for MemoryChatStore {
    async fn entries(&self, artist_id: Uuid) -> StorageResult<Vec<KnowledgeEntry>> {
        Ok(self
            .state
            .read()
            .await
            .knowledge
            .get(&artist_id)
            .map(|entries| entries.iter().filter(|e| e.is_textual()).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_room(account_id: Uuid) -> NewRoom {
        NewRoom {
            id: Uuid::new_v4(),
            account_id,
            artist_id: None,
            topic: "Tour planning".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_room_is_idempotent() {
        let store = MemoryChatStore::new();
        let room = new_room(Uuid::new_v4());

        let first = store.create_room(room.clone()).await.unwrap();
        let mut again = room.clone();
        again.topic = "Different".to_string();
        let second = store.create_room(again).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.topic, "Tour planning");
    }

    #[tokio::test]
    async fn test_insert_appends_in_order() {
        let store = MemoryChatStore::new();
        let room = store.create_room(new_room(Uuid::new_v4())).await.unwrap();
        let a = Message::user("a");
        let b = Message::assistant("b");
        let c = Message::user("c");

        store.insert_messages(room.id, &[a.clone(), b.clone()]).await.unwrap();
        store.insert_messages(room.id, &[c.clone()]).await.unwrap();

        let ids: Vec<Uuid> = store
            .get_messages(room.id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_ids() {
        let store = MemoryChatStore::new();
        let room = store.create_room(new_room(Uuid::new_v4())).await.unwrap();
        let a = Message::user("a");

        store.insert_messages(room.id, &[a.clone()]).await.unwrap();
        let err = store.insert_messages(room.id, &[a]).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
    }

    #[tokio::test]
    async fn test_insert_into_missing_room_fails() {
        let store = MemoryChatStore::new();
        let missing = Uuid::new_v4();
        let err = store
            .insert_messages(missing, &[Message::user("a")])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RoomNotFound(id) if id == missing));
    }

    #[tokio::test]
    async fn test_delete_room_cascades() {
        let store = MemoryChatStore::new();
        let room = store.create_room(new_room(Uuid::new_v4())).await.unwrap();
        store.insert_messages(room.id, &[Message::user("a")]).await.unwrap();

        assert!(store.delete_room(room.id).await.unwrap());
        assert!(store.get_messages(room.id).await.unwrap().is_empty());
        assert!(!store.delete_room(room.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_writes_switch() {
        let store = MemoryChatStore::new();
        store.set_fail_writes(true);
        assert!(store.create_room(new_room(Uuid::new_v4())).await.is_err());
        store.set_fail_writes(false);
        assert!(store.create_room(new_room(Uuid::new_v4())).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_reads_switch() {
        let store = MemoryChatStore::new();
        let room = store.create_room(new_room(Uuid::new_v4())).await.unwrap();

        store.set_fail_reads(true);
        assert!(store.get_room(room.id).await.is_err());
        assert!(store.get_messages(room.id).await.is_err());
        store.set_fail_reads(false);
        assert!(store.get_room(room.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_rooms_filters_by_account() {
        let store = MemoryChatStore::new();
        let mine = Uuid::new_v4();
        store.create_room(new_room(mine)).await.unwrap();
        store.create_room(new_room(mine)).await.unwrap();
        store.create_room(new_room(Uuid::new_v4())).await.unwrap();

        assert_eq!(store.list_rooms(mine).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_knowledge_filters_non_text() {
        let store = MemoryChatStore::new();
        let artist_id = Uuid::new_v4();
        store
            .add_knowledge(
                artist_id,
                KnowledgeEntry {
                    name: "bio.md".to_string(),
                    mime_type: "text/markdown".to_string(),
                    content: "Nova is a synth-pop act".to_string(),
                },
            )
            .await;
        store
            .add_knowledge(
                artist_id,
                KnowledgeEntry {
                    name: "cover.png".to_string(),
                    mime_type: "image/png".to_string(),
                    content: String::new(),
                },
            )
            .await;

        let entries = store.entries(artist_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "bio.md");
    }
}
