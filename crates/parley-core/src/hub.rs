//! Room hubs: the live fan-out side of a room.
//!
//! A hub is the set of currently connected sockets joined to one room,
//! distinct from the room's durable member list. Fan-out rides a tokio
//! broadcast channel; each connection task holds a receiver.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::events::RoomEvent;

/// Default broadcast capacity per room. Slow receivers that fall behind
/// skip events (RecvError::Lagged).
const DEFAULT_HUB_CAPACITY: usize = 1024;

/// The live fan-out target for one room.
#[derive(Debug)]
pub struct RoomHub {
    room_id: Uuid,
    sender: broadcast::Sender<Arc<RoomEvent>>,
    connections: HashSet<String>,
}

impl RoomHub {
    #[must_use]
    pub fn new(room_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            room_id,
            sender,
            connections: HashSet::new(),
        }
    }

    #[must_use]
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains(connection_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Join a connection to this hub, returning its event receiver.
    ///
    /// Re-joining is idempotent for membership but always hands back a
    /// fresh receiver.
    pub fn join(&mut self, connection_id: impl Into<String>) -> broadcast::Receiver<Arc<RoomEvent>> {
        let conn_id = connection_id.into();
        self.connections.insert(conn_id.clone());
        debug!(room = %self.room_id, connection = %conn_id, "Connection joined hub");
        self.sender.subscribe()
    }

    /// Remove a connection. Returns `true` if it was joined.
    pub fn leave(&mut self, connection_id: &str) -> bool {
        let removed = self.connections.remove(connection_id);
        if removed {
            debug!(room = %self.room_id, connection = %connection_id, "Connection left hub");
        }
        removed
    }

    /// Fan an event out to every joined connection.
    ///
    /// Returns the number of receivers the event reached.
    pub fn broadcast(&self, event: RoomEvent) -> usize {
        trace!(room = %self.room_id, "Broadcasting room event");
        self.sender.send(Arc::new(event)).unwrap_or_default()
    }
}

/// All live room hubs, keyed by room id.
///
/// Hubs are created on first join and removed when their last connection
/// leaves.
#[derive(Debug)]
pub struct HubTable {
    hubs: DashMap<Uuid, RoomHub>,
    capacity: usize,
}

impl Default for HubTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HubTable {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HUB_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            hubs: DashMap::new(),
            capacity,
        }
    }

    /// Join a connection to a room's hub, creating the hub on demand.
    pub fn join(
        &self,
        room_id: Uuid,
        connection_id: &str,
    ) -> broadcast::Receiver<Arc<RoomEvent>> {
        let mut hub = self
            .hubs
            .entry(room_id)
            .or_insert_with(|| RoomHub::new(room_id, self.capacity));
        hub.join(connection_id)
    }

    /// Remove a connection from a room's hub. Empty hubs are dropped.
    ///
    /// Returns `true` if the connection was joined.
    pub fn leave(&self, room_id: Uuid, connection_id: &str) -> bool {
        let Some(mut hub) = self.hubs.get_mut(&room_id) else {
            return false;
        };
        let removed = hub.leave(connection_id);
        if hub.is_empty() {
            drop(hub); // release the shard lock
            self.hubs.remove(&room_id);
            debug!(room = %room_id, "Dropped empty hub");
        }
        removed
    }

    /// Fan an event out to a room. Returns the receiver count (0 when no
    /// hub is live for the room).
    pub fn broadcast(&self, room_id: Uuid, event: RoomEvent) -> usize {
        self.hubs
            .get(&room_id)
            .map(|hub| hub.broadcast(event))
            .unwrap_or(0)
    }

    /// Whether a connection is currently joined to a room's hub.
    #[must_use]
    pub fn contains(&self, room_id: Uuid, connection_id: &str) -> bool {
        self.hubs
            .get(&room_id)
            .is_some_and(|hub| hub.contains(connection_id))
    }

    /// Live connection count for a room.
    #[must_use]
    pub fn connection_count(&self, room_id: Uuid) -> usize {
        self.hubs
            .get(&room_id)
            .map(|hub| hub.connection_count())
            .unwrap_or(0)
    }

    /// Number of live hubs.
    #[must_use]
    pub fn hub_count(&self) -> usize {
        self.hubs.len()
    }
}
