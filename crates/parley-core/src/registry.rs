//! Session registry: live connections and their room memberships.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::events::RoomEvent;
use crate::hub::HubTable;
use crate::model::Identity;
use crate::store::MessageStore;

/// A live, authenticated connection.
///
/// Created on a successful handshake, destroyed on disconnect. Owned
/// exclusively by the registry once registered.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub identity: Identity,
    /// Rooms this connection is currently joined to.
    pub rooms: HashSet<Uuid>,
}

/// Tracks live connections and coordinates their hub memberships.
///
/// Membership changes are not broadcast to the room: there are no
/// presence events in the base design.
pub struct SessionRegistry {
    connections: DashMap<String, Connection>,
    hubs: Arc<HubTable>,
    store: Arc<dyn MessageStore>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(hubs: Arc<HubTable>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            connections: DashMap::new(),
            hubs,
            store,
        }
    }

    /// Register an authenticated connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::AlreadyRegistered`] if the connection id is
    /// already live.
    pub fn register(&self, connection_id: impl Into<String>, identity: Identity) -> Result<()> {
        let conn_id = connection_id.into();
        if self.connections.contains_key(&conn_id) {
            return Err(ChatError::AlreadyRegistered(conn_id));
        }

        info!(connection = %conn_id, user = %identity.username, "Connection registered");
        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id,
                identity,
                rooms: HashSet::new(),
            },
        );
        Ok(())
    }

    /// The authenticated identity of a live connection.
    #[must_use]
    pub fn identity(&self, connection_id: &str) -> Option<Identity> {
        self.connections
            .get(connection_id)
            .map(|c| c.identity.clone())
    }

    /// Join a connection to a room.
    ///
    /// Verifies the room exists and, for private rooms, that the supplied
    /// password matches the stored hash. On first join the user is also
    /// added to the room's durable member list. Re-joining an
    /// already-joined room is a no-op success (a fresh receiver is handed
    /// back either way).
    ///
    /// # Errors
    ///
    /// [`ChatError::RoomNotFound`] for an unknown room,
    /// [`ChatError::Forbidden`] on a password mismatch.
    pub async fn join_room(
        &self,
        connection_id: &str,
        room_id: Uuid,
        password: Option<&str>,
    ) -> Result<broadcast::Receiver<Arc<RoomEvent>>> {
        let identity = self
            .identity(connection_id)
            .ok_or_else(|| ChatError::Auth("connection not registered".into()))?;

        let mut room = self
            .store
            .room(room_id)
            .await?
            .ok_or(ChatError::RoomNotFound(room_id))?;

        if !room.verify_password(password) {
            return Err(ChatError::Forbidden("wrong room password"));
        }

        if !room.is_member(identity.user_id) {
            room.add_member(identity.user_id);
            self.store.update_room(room).await?;
        }

        let receiver = self.hubs.join(room_id, connection_id);
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.rooms.insert(room_id);
        }

        debug!(
            connection = %connection_id,
            room = %room_id,
            live = self.hubs.connection_count(room_id),
            "Joined room"
        );
        Ok(receiver)
    }

    /// Leave a room. Idempotent; leaving a room the connection is not in
    /// is a quiet success.
    pub fn leave_room(&self, connection_id: &str, room_id: Uuid) -> bool {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.rooms.remove(&room_id);
        }
        self.hubs.leave(room_id, connection_id)
    }

    /// Remove a connection from every hub it belongs to and discard it.
    pub fn unregister(&self, connection_id: &str) {
        if let Some((_, conn)) = self.connections.remove(connection_id) {
            for room_id in &conn.rooms {
                self.hubs.leave(*room_id, connection_id);
            }
            info!(connection = %connection_id, "Connection unregistered");
        }
    }

    /// Rooms the connection is currently joined to.
    #[must_use]
    pub fn connection_rooms(&self, connection_id: &str) -> Vec<Uuid> {
        self.connections
            .get(connection_id)
            .map(|c| c.rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Room;
    use crate::store::{MemoryStore, MessageStore as _};

    async fn registry_with(rooms: Vec<Room>) -> (SessionRegistry, Arc<HubTable>) {
        let hubs = Arc::new(HubTable::new());
        let store = Arc::new(MemoryStore::new());
        for room in rooms {
            store.create_room(room).await.unwrap();
        }
        (SessionRegistry::new(hubs.clone(), store), hubs)
    }

    fn identity(name: &str) -> Identity {
        Identity::new(Uuid::new_v4(), name)
    }

    #[tokio::test]
    async fn test_register_twice_fails() {
        let (registry, _) = registry_with(vec![]).await;
        registry.register("conn-1", identity("alice")).unwrap();
        assert!(matches!(
            registry.register("conn-1", identity("alice")),
            Err(ChatError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let (registry, _) = registry_with(vec![]).await;
        registry.register("conn-1", identity("alice")).unwrap();
        assert!(matches!(
            registry.join_room("conn-1", Uuid::new_v4(), None).await,
            Err(ChatError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let room = Room::new("general", Uuid::new_v4());
        let room_id = room.id;
        let (registry, hubs) = registry_with(vec![room]).await;
        registry.register("conn-1", identity("alice")).unwrap();

        let _rx = registry.join_room("conn-1", room_id, None).await.unwrap();
        assert_eq!(hubs.connection_count(room_id), 1);

        // Second join: hub membership grows by at most one overall
        let _rx2 = registry.join_room("conn-1", room_id, None).await.unwrap();
        assert_eq!(hubs.connection_count(room_id), 1);
    }

    #[tokio::test]
    async fn test_private_room_password() {
        let creator = Uuid::new_v4();
        let room = Room::private("vip", creator, "secret").unwrap();
        let room_id = room.id;
        let (registry, hubs) = registry_with(vec![room]).await;
        registry.register("conn-1", identity("carol")).unwrap();

        assert!(matches!(
            registry.join_room("conn-1", room_id, Some("wrong")).await,
            Err(ChatError::Forbidden(_))
        ));
        assert_eq!(hubs.connection_count(room_id), 0);

        let _rx = registry
            .join_room("conn-1", room_id, Some("secret"))
            .await
            .unwrap();
        assert_eq!(hubs.connection_count(room_id), 1);
    }

    #[tokio::test]
    async fn test_unregister_leaves_all_hubs() {
        let room_a = Room::new("a", Uuid::new_v4());
        let room_b = Room::new("b", Uuid::new_v4());
        let (a, b) = (room_a.id, room_b.id);
        let (registry, hubs) = registry_with(vec![room_a, room_b]).await;
        registry.register("conn-1", identity("alice")).unwrap();

        let _rx_a = registry.join_room("conn-1", a, None).await.unwrap();
        let _rx_b = registry.join_room("conn-1", b, None).await.unwrap();
        assert_eq!(registry.connection_rooms("conn-1").len(), 2);

        registry.unregister("conn-1");
        assert_eq!(hubs.connection_count(a), 0);
        assert_eq!(hubs.connection_count(b), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let room = Room::new("general", Uuid::new_v4());
        let room_id = room.id;
        let (registry, _) = registry_with(vec![room]).await;
        registry.register("conn-1", identity("alice")).unwrap();

        let _rx = registry.join_room("conn-1", room_id, None).await.unwrap();
        assert!(registry.leave_room("conn-1", room_id));
        assert!(!registry.leave_room("conn-1", room_id));
    }
}
