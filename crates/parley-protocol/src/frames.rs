//! Frame types for the Parley protocol.
//!
//! Frames are the unit of communication between chat clients and the
//! server. Each frame is serialized using MessagePack for efficient
//! binary encoding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// Malformed or unexpected frame.
    pub const PROTOCOL: u16 = 1001;
    /// Private-room password mismatch or insufficient rights.
    pub const FORBIDDEN: u16 = 4003;
    /// Missing or invalid credential during the handshake.
    pub const AUTH: u16 = 4001;
    /// Unknown room or message.
    pub const NOT_FOUND: u16 = 4004;
    /// Schedule/vanish request with a non-future or zero duration.
    pub const INVALID_TIME: u16 = 4008;
    /// Store unavailable or a write failed.
    pub const PERSISTENCE: u16 = 5000;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    JoinRoom = 0x03,
    LeaveRoom = 0x04,
    Send = 0x05,
    Message = 0x06,
    Schedule = 0x07,
    Scheduled = 0x08,
    CancelSchedule = 0x09,
    SetVanish = 0x0A,
    VanishSet = 0x0B,
    MessageDeleted = 0x0C,
    AddReaction = 0x0D,
    Reaction = 0x0E,
    RemoveReaction = 0x0F,
    ReactionRemoved = 0x10,
    Pin = 0x11,
    Pinned = 0x12,
    Unpin = 0x13,
    Unpinned = 0x14,
    Typing = 0x15,
    Ack = 0x16,
    Error = 0x17,
    Ping = 0x18,
    Pong = 0x19,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::JoinRoom),
            0x04 => Ok(FrameType::LeaveRoom),
            0x05 => Ok(FrameType::Send),
            0x06 => Ok(FrameType::Message),
            0x07 => Ok(FrameType::Schedule),
            0x08 => Ok(FrameType::Scheduled),
            0x09 => Ok(FrameType::CancelSchedule),
            0x0A => Ok(FrameType::SetVanish),
            0x0B => Ok(FrameType::VanishSet),
            0x0C => Ok(FrameType::MessageDeleted),
            0x0D => Ok(FrameType::AddReaction),
            0x0E => Ok(FrameType::Reaction),
            0x0F => Ok(FrameType::RemoveReaction),
            0x10 => Ok(FrameType::ReactionRemoved),
            0x11 => Ok(FrameType::Pin),
            0x12 => Ok(FrameType::Pinned),
            0x13 => Ok(FrameType::Unpin),
            0x14 => Ok(FrameType::Unpinned),
            0x15 => Ok(FrameType::Typing),
            0x16 => Ok(FrameType::Ack),
            0x17 => Ok(FrameType::Error),
            0x18 => Ok(FrameType::Ping),
            0x19 => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// The media kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Gif,
    Voice,
    System,
}

/// Why a message was removed from its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteReason {
    /// The message's vanish deadline expired.
    Vanished,
    /// Explicit deletion by a user.
    Deleted,
}

/// A single reaction as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    /// The reaction emoji.
    pub emoji: String,
    /// The reacting user.
    pub user: Uuid,
}

/// A stored message as broadcast to room members.
///
/// Receivers that locally echo an optimistic insert must treat an
/// incoming payload with the same (sender, created_at, content) triple
/// as a duplicate of the local copy and drop it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Server-assigned message id.
    pub id: Uuid,
    /// Media kind.
    pub kind: MessageKind,
    /// Kind-specific content (text body, image URL, gif id, ...).
    pub content: String,
    /// Free-form kind-specific metadata (voice duration, gif source, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// The room this message belongs to.
    pub room: Uuid,
    /// Sending user.
    pub sender: Uuid,
    /// Sending user's display name at send time.
    pub sender_name: String,
    /// Server-assigned creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Message this one replies to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    /// Instant at which the message will self-delete, if armed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vanish_at: Option<DateTime<Utc>>,
    /// Reactions attached so far.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<ReactionPayload>,
}

/// A protocol frame.
///
/// Client-originated frames carry a request `id` where the server
/// responds with `ack {id}` or `error {id, ...}`. Room-scoped server
/// frames are fanned out to every live connection in the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial handshake; must be the first client frame.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
        /// Authentication token.
        token: String,
    },

    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Join a room's live fan-out.
    #[serde(rename = "join_room")]
    JoinRoom {
        /// Request ID for acknowledgment.
        id: u64,
        /// Target room.
        room: Uuid,
        /// Password, required for private rooms.
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// Leave a room's live fan-out.
    #[serde(rename = "leave_room")]
    LeaveRoom { id: u64, room: Uuid },

    /// Submit a new message.
    #[serde(rename = "send")]
    Send {
        id: u64,
        room: Uuid,
        kind: MessageKind,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<Uuid>,
        /// Self-delete the message this many minutes after delivery.
        #[serde(skip_serializing_if = "Option::is_none")]
        vanish_minutes: Option<u32>,
    },

    /// A message accepted into a room (live, scheduled, or echo).
    #[serde(rename = "message")]
    Message { message: MessagePayload },

    /// Defer a message to a future instant.
    #[serde(rename = "schedule")]
    Schedule {
        id: u64,
        room: Uuid,
        kind: MessageKind,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        /// Instant at which the message becomes visible.
        fire_at: DateTime<Utc>,
    },

    /// Schedule accepted.
    #[serde(rename = "scheduled")]
    Scheduled {
        /// ID of the acknowledged request.
        id: u64,
        /// Scheduler entry id, usable for cancellation.
        entry: Uuid,
    },

    /// Cancel a pending scheduled message.
    #[serde(rename = "cancel_schedule")]
    CancelSchedule { id: u64, entry: Uuid },

    /// Arm a vanish deadline on a delivered message.
    #[serde(rename = "set_vanish")]
    SetVanish {
        id: u64,
        message: Uuid,
        /// Minutes from now until self-deletion.
        ttl_minutes: u32,
    },

    /// A vanish deadline was armed (sent to the whole room).
    #[serde(rename = "vanish_set")]
    VanishSet {
        message: Uuid,
        vanish_at: DateTime<Utc>,
    },

    /// A message was removed from its room.
    #[serde(rename = "message_deleted")]
    MessageDeleted {
        message: Uuid,
        reason: DeleteReason,
    },

    /// Add a reaction to a message.
    #[serde(rename = "add_reaction")]
    AddReaction {
        id: u64,
        message: Uuid,
        emoji: String,
    },

    /// A reaction was added (sent to the whole room).
    #[serde(rename = "reaction")]
    Reaction {
        message: Uuid,
        emoji: String,
        user: Uuid,
        username: String,
    },

    /// Remove a reaction from a message.
    #[serde(rename = "remove_reaction")]
    RemoveReaction {
        id: u64,
        message: Uuid,
        emoji: String,
    },

    /// A reaction was removed (sent to the whole room).
    #[serde(rename = "reaction_removed")]
    ReactionRemoved {
        message: Uuid,
        emoji: String,
        user: Uuid,
    },

    /// Pin a message (room admins only).
    #[serde(rename = "pin")]
    Pin { id: u64, message: Uuid },

    /// A message was pinned.
    #[serde(rename = "pinned")]
    Pinned {
        message: Uuid,
        by: Uuid,
        at: DateTime<Utc>,
    },

    /// Unpin a message (room admins only).
    #[serde(rename = "unpin")]
    Unpin { id: u64, message: Uuid },

    /// A message was unpinned.
    #[serde(rename = "unpinned")]
    Unpinned { message: Uuid },

    /// Typing indicator. Inbound carries no user; the relayed outbound
    /// form does, and is never echoed back to the typist.
    #[serde(rename = "typing")]
    Typing {
        room: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        active: bool,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        id: u64,
        /// Outcome of an idempotent mutation: `false` marks a quiet
        /// no-op (duplicate reaction, re-pin). Absent on plain acks.
        #[serde(skip_serializing_if = "Option::is_none")]
        applied: Option<bool>,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code (see [`codes`]).
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::JoinRoom { .. } => FrameType::JoinRoom,
            Frame::LeaveRoom { .. } => FrameType::LeaveRoom,
            Frame::Send { .. } => FrameType::Send,
            Frame::Message { .. } => FrameType::Message,
            Frame::Schedule { .. } => FrameType::Schedule,
            Frame::Scheduled { .. } => FrameType::Scheduled,
            Frame::CancelSchedule { .. } => FrameType::CancelSchedule,
            Frame::SetVanish { .. } => FrameType::SetVanish,
            Frame::VanishSet { .. } => FrameType::VanishSet,
            Frame::MessageDeleted { .. } => FrameType::MessageDeleted,
            Frame::AddReaction { .. } => FrameType::AddReaction,
            Frame::Reaction { .. } => FrameType::Reaction,
            Frame::RemoveReaction { .. } => FrameType::RemoveReaction,
            Frame::ReactionRemoved { .. } => FrameType::ReactionRemoved,
            Frame::Pin { .. } => FrameType::Pin,
            Frame::Pinned { .. } => FrameType::Pinned,
            Frame::Unpin { .. } => FrameType::Unpin,
            Frame::Unpinned { .. } => FrameType::Unpinned,
            Frame::Typing { .. } => FrameType::Typing,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: impl Into<String>) -> Self {
        Frame::Connect {
            version,
            token: token.into(),
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id, applied: None }
    }

    /// Create an Ack frame carrying an idempotent-mutation outcome.
    #[must_use]
    pub fn ack_applied(id: u64, applied: bool) -> Self {
        Frame::Ack {
            id,
            applied: Some(applied),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create an outbound message frame.
    #[must_use]
    pub fn message(message: MessagePayload) -> Self {
        Frame::Message { message }
    }
}
