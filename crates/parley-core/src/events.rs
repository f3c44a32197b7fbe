//! Events fanned out to the live connections of a room.

use chrono::{DateTime, Utc};
use parley_protocol::DeleteReason;
use uuid::Uuid;

use crate::model::StoredMessage;

/// An event delivered to every live connection in a room hub.
///
/// The server layer converts these into wire frames. `Typing` carries the
/// originating connection so the relay can skip echoing it back to the
/// typist; every other event is delivered to the sender too, so all room
/// members converge on one stored object.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A message was accepted into the room (live or scheduled delivery).
    Message(StoredMessage),

    /// A reaction was added.
    ReactionAdded {
        message_id: Uuid,
        emoji: String,
        user_id: Uuid,
        username: String,
    },

    /// A reaction was removed.
    ReactionRemoved {
        message_id: Uuid,
        emoji: String,
        user_id: Uuid,
    },

    /// A vanish deadline was armed on a message.
    VanishSet {
        message_id: Uuid,
        vanish_at: DateTime<Utc>,
    },

    /// A message was removed from the room.
    MessageDeleted {
        message_id: Uuid,
        reason: DeleteReason,
    },

    /// A message was pinned.
    Pinned {
        message_id: Uuid,
        by: Uuid,
        at: DateTime<Utc>,
    },

    /// A message was unpinned.
    Unpinned { message_id: Uuid },

    /// A member is typing. Never persisted, never echoed to the source.
    Typing {
        room_id: Uuid,
        user_id: Uuid,
        username: String,
        active: bool,
        /// Connection that produced the indicator.
        source: String,
    },
}

impl RoomEvent {
    /// Whether this event should be delivered to the given connection.
    #[must_use]
    pub fn should_deliver_to(&self, connection_id: &str) -> bool {
        match self {
            RoomEvent::Typing { source, .. } => source != connection_id,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typing_not_echoed_to_source() {
        let event = RoomEvent::Typing {
            room_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            username: "alice".into(),
            active: true,
            source: "conn-1".into(),
        };

        assert!(!event.should_deliver_to("conn-1"));
        assert!(event.should_deliver_to("conn-2"));
    }

    #[test]
    fn test_deleted_delivered_everywhere() {
        let event = RoomEvent::MessageDeleted {
            message_id: Uuid::new_v4(),
            reason: DeleteReason::Vanished,
        };
        assert!(event.should_deliver_to("conn-1"));
    }
}
