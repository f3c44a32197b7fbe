//! The durable store boundary.
//!
//! The engine treats persistence as an external collaborator behind
//! [`MessageStore`]. Store calls are the only suspension points in the
//! message path; the pipeline and the vanisher wrap them in a timeout
//! and classify expiry as a persistence error.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::model::{Room, StoredMessage};

/// Durable CRUD for rooms and messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create a room.
    async fn create_room(&self, room: Room) -> Result<()>;

    /// Fetch a room by id.
    async fn room(&self, id: Uuid) -> Result<Option<Room>>;

    /// Fetch a room by its unique name.
    async fn room_by_name(&self, name: &str) -> Result<Option<Room>>;

    /// Replace a room's stored state.
    async fn update_room(&self, room: Room) -> Result<()>;

    /// Insert a new message.
    async fn insert_message(&self, message: StoredMessage) -> Result<()>;

    /// Fetch a message by id.
    async fn message(&self, id: Uuid) -> Result<Option<StoredMessage>>;

    /// Replace a message's stored state.
    async fn update_message(&self, message: StoredMessage) -> Result<()>;

    /// Delete a message. Returns `false` if it did not exist.
    async fn delete_message(&self, id: Uuid) -> Result<bool>;

    /// Messages of a room, oldest first, up to `limit`.
    async fn messages_for_room(&self, room_id: Uuid, limit: usize) -> Result<Vec<StoredMessage>>;
}

/// In-memory store used by tests and dev runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: DashMap<Uuid, Room>,
    messages: DashMap<Uuid, StoredMessage>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages. Test helper.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_room(&self, room: Room) -> Result<()> {
        if self.rooms.iter().any(|r| r.name == room.name) {
            return Err(ChatError::Persistence(format!(
                "room name taken: {}",
                room.name
            )));
        }
        self.rooms.insert(room.id, room);
        Ok(())
    }

    async fn room(&self, id: Uuid) -> Result<Option<Room>> {
        Ok(self.rooms.get(&id).map(|r| r.clone()))
    }

    async fn room_by_name(&self, name: &str) -> Result<Option<Room>> {
        Ok(self
            .rooms
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.clone()))
    }

    async fn update_room(&self, room: Room) -> Result<()> {
        self.rooms.insert(room.id, room);
        Ok(())
    }

    async fn insert_message(&self, message: StoredMessage) -> Result<()> {
        self.messages.insert(message.id, message);
        Ok(())
    }

    async fn message(&self, id: Uuid) -> Result<Option<StoredMessage>> {
        Ok(self.messages.get(&id).map(|m| m.clone()))
    }

    async fn update_message(&self, message: StoredMessage) -> Result<()> {
        self.messages.insert(message.id, message);
        Ok(())
    }

    async fn delete_message(&self, id: Uuid) -> Result<bool> {
        Ok(self.messages.remove(&id).is_some())
    }

    async fn messages_for_room(&self, room_id: Uuid, limit: usize) -> Result<Vec<StoredMessage>> {
        let mut messages: Vec<StoredMessage> = self
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .map(|m| m.clone())
            .collect();
        messages.sort_by_key(|m| m.created_at);
        messages.truncate(limit);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewMessageRequest;
    use crate::model::Identity;
    use chrono::Utc;
    use parley_protocol::MessageKind;

    fn stored(room_id: Uuid, content: &str) -> StoredMessage {
        let req = NewMessageRequest::text(room_id, Identity::new(Uuid::new_v4(), "alice"), content);
        StoredMessage {
            id: Uuid::new_v4(),
            kind: MessageKind::Text,
            content: req.content,
            metadata: None,
            room_id,
            sender: req.sender.user_id,
            sender_name: req.sender.username,
            created_at: Utc::now(),
            pin: None,
            reactions: Vec::new(),
            reply_to: None,
            vanish_at: None,
        }
    }

    #[tokio::test]
    async fn test_room_crud() {
        let store = MemoryStore::new();
        let room = Room::new("general", Uuid::new_v4());
        let id = room.id;

        store.create_room(room).await.unwrap();
        assert!(store.room(id).await.unwrap().is_some());
        assert!(store.room_by_name("general").await.unwrap().is_some());
        assert!(store.room_by_name("nope").await.unwrap().is_none());

        // Unique name constraint
        let dup = Room::new("general", Uuid::new_v4());
        assert!(store.create_room(dup).await.is_err());
    }

    #[tokio::test]
    async fn test_message_crud_and_ordering() {
        let store = MemoryStore::new();
        let room_id = Uuid::new_v4();

        let first = stored(room_id, "first");
        let second = stored(room_id, "second");
        let first_id = first.id;

        store.insert_message(first).await.unwrap();
        store.insert_message(second).await.unwrap();
        store.insert_message(stored(Uuid::new_v4(), "other room")).await.unwrap();

        let messages = store.messages_for_room(room_id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].created_at <= messages[1].created_at);

        assert!(store.delete_message(first_id).await.unwrap());
        assert!(!store.delete_message(first_id).await.unwrap());
    }
}
