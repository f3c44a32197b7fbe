//! Domain model: rooms, messages, reactions, identities.

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Utc};
use parley_protocol::{MessageKind, MessagePayload, ReactionPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ChatError, Result};

/// A stable, authenticated user identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// A single reaction on a message.
///
/// Uniqueness of (message, emoji, user) is an invariant; the containing
/// message enforces it on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: Uuid,
}

/// Pin record on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinInfo {
    pub pinned_by: Uuid,
    pub pinned_at: DateTime<Utc>,
}

/// A durable chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub kind: MessageKind,
    pub content: String,
    pub metadata: Option<Value>,
    pub room_id: Uuid,
    pub sender: Uuid,
    pub sender_name: String,
    pub created_at: DateTime<Utc>,
    pub pin: Option<PinInfo>,
    pub reactions: Vec<Reaction>,
    pub reply_to: Option<Uuid>,
    pub vanish_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// Append a reaction, keeping (emoji, user) set semantics.
    ///
    /// Returns `false` without mutating if the same user already reacted
    /// with the same emoji.
    pub fn add_reaction(&mut self, emoji: impl Into<String>, user_id: Uuid) -> bool {
        let emoji = emoji.into();
        if self
            .reactions
            .iter()
            .any(|r| r.emoji == emoji && r.user_id == user_id)
        {
            return false;
        }
        self.reactions.push(Reaction { emoji, user_id });
        true
    }

    /// Remove a reaction. Returns `false` if it was not present.
    pub fn remove_reaction(&mut self, emoji: &str, user_id: Uuid) -> bool {
        let before = self.reactions.len();
        self.reactions
            .retain(|r| !(r.emoji == emoji && r.user_id == user_id));
        self.reactions.len() != before
    }

    /// Duplicate-detection key for client-side echo suppression: a
    /// receiver that optimistically inserted a local copy drops any
    /// incoming message with an equal triple.
    #[must_use]
    pub fn dedup_key(&self) -> (Uuid, DateTime<Utc>, &str) {
        (self.sender, self.created_at, &self.content)
    }
}

impl From<&StoredMessage> for MessagePayload {
    fn from(msg: &StoredMessage) -> Self {
        MessagePayload {
            id: msg.id,
            kind: msg.kind,
            content: msg.content.clone(),
            metadata: msg.metadata.clone(),
            room: msg.room_id,
            sender: msg.sender,
            sender_name: msg.sender_name.clone(),
            created_at: msg.created_at,
            reply_to: msg.reply_to,
            vanish_at: msg.vanish_at,
            reactions: msg
                .reactions
                .iter()
                .map(|r| ReactionPayload {
                    emoji: r.emoji.clone(),
                    user: r.user_id,
                })
                .collect(),
        }
    }
}

/// A request to submit a new message to a room.
#[derive(Debug, Clone)]
pub struct NewMessageRequest {
    pub kind: MessageKind,
    pub content: String,
    pub metadata: Option<Value>,
    pub room_id: Uuid,
    pub sender: Identity,
    pub reply_to: Option<Uuid>,
    pub vanish_minutes: Option<u32>,
}

impl NewMessageRequest {
    /// A plain text message, the common case.
    #[must_use]
    pub fn text(room_id: Uuid, sender: Identity, content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: content.into(),
            metadata: None,
            room_id,
            sender,
            reply_to: None,
            vanish_minutes: None,
        }
    }
}

/// A durable chat room.
///
/// Invariants, enforced by the mutating methods: admins are a subset of
/// members, the creator is always an admin, and the creator can never be
/// removed from either set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub name: String,
    pub topic: String,
    pub private: bool,
    /// Argon2id PHC string; present iff the room is private.
    pub password_hash: Option<String>,
    /// Ordered member list (join order).
    pub members: Vec<Uuid>,
    pub admins: Vec<Uuid>,
    pub creator: Uuid,
    pub last_activity: DateTime<Utc>,
}

impl Room {
    /// Create a public room. The creator becomes member and admin.
    #[must_use]
    pub fn new(name: impl Into<String>, creator: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            topic: String::new(),
            private: false,
            password_hash: None,
            members: vec![creator],
            admins: vec![creator],
            creator,
            last_activity: Utc::now(),
        }
    }

    /// Create a private room guarded by a password.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Persistence`] if hashing fails.
    pub fn private(name: impl Into<String>, creator: Uuid, password: &str) -> Result<Self> {
        let mut room = Self::new(name, creator);
        room.private = true;
        room.password_hash = Some(hash_password(password)?);
        Ok(room)
    }

    /// Verify a join password against the stored hash.
    ///
    /// Public rooms accept any (or no) password. Private rooms require a
    /// matching one.
    #[must_use]
    pub fn verify_password(&self, supplied: Option<&str>) -> bool {
        match (&self.password_hash, supplied) {
            (None, _) => true,
            (Some(hash), Some(supplied)) => {
                let Ok(parsed) = PasswordHash::new(hash) else {
                    return false;
                };
                Argon2::default()
                    .verify_password(supplied.as_bytes(), &parsed)
                    .is_ok()
            }
            (Some(_), None) => false,
        }
    }

    #[must_use]
    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.members.contains(&user_id)
    }

    #[must_use]
    pub fn is_admin(&self, user_id: Uuid) -> bool {
        self.admins.contains(&user_id)
    }

    /// Add a member. Idempotent.
    pub fn add_member(&mut self, user_id: Uuid) {
        if !self.is_member(user_id) {
            self.members.push(user_id);
        }
    }

    /// Remove a member (and any admin role). The creator cannot be
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Forbidden`] when targeting the creator.
    pub fn remove_member(&mut self, user_id: Uuid) -> Result<()> {
        if user_id == self.creator {
            return Err(ChatError::Forbidden("cannot remove the room creator"));
        }
        self.members.retain(|m| *m != user_id);
        self.admins.retain(|a| *a != user_id);
        Ok(())
    }

    /// Promote a member to admin.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Forbidden`] if the user is not a member.
    pub fn promote(&mut self, user_id: Uuid) -> Result<()> {
        if !self.is_member(user_id) {
            return Err(ChatError::Forbidden("only members can be admins"));
        }
        if !self.is_admin(user_id) {
            self.admins.push(user_id);
        }
        Ok(())
    }

    /// Demote an admin. The creator cannot be demoted.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Forbidden`] when targeting the creator.
    pub fn demote(&mut self, user_id: Uuid) -> Result<()> {
        if user_id == self.creator {
            return Err(ChatError::Forbidden("cannot demote the room creator"));
        }
        self.admins.retain(|a| *a != user_id);
        Ok(())
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}

/// Hash a room password with Argon2id and a fresh salt.
///
/// # Errors
///
/// Returns [`ChatError::Persistence`] if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ChatError::Persistence(format!("password hashing failed: {e}")))
}
