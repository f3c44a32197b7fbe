//! The broadcast pipeline: validate, persist, fan out.
//!
//! `submit` is one atomic step per room: a per-room lock is held across
//! persist + broadcast, which yields submission-acceptance ordering for
//! everything fanned out to that room. Nothing is broadcast if
//! persistence fails.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::events::RoomEvent;
use crate::hub::HubTable;
use crate::model::{Identity, NewMessageRequest, PinInfo, Room, StoredMessage};
use crate::store::MessageStore;
use crate::vanisher::Vanisher;
use parley_protocol::DeleteReason;

/// Default ceiling on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Validates, persists, and fans out messages and reactions.
pub struct Pipeline {
    store: Arc<dyn MessageStore>,
    hubs: Arc<HubTable>,
    vanisher: Arc<Vanisher>,
    /// Per-room submit locks; serialize persist + broadcast per room.
    submit_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    store_timeout: Duration,
}

impl Pipeline {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, hubs: Arc<HubTable>, vanisher: Arc<Vanisher>) -> Self {
        Self::with_store_timeout(store, hubs, vanisher, DEFAULT_STORE_TIMEOUT)
    }

    #[must_use]
    pub fn with_store_timeout(
        store: Arc<dyn MessageStore>,
        hubs: Arc<HubTable>,
        vanisher: Arc<Vanisher>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            hubs,
            vanisher,
            submit_locks: DashMap::new(),
            store_timeout,
        }
    }

    /// Bound a store call; expiry is a persistence failure.
    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| ChatError::Persistence("store call timed out".into()))?
    }

    fn submit_lock(&self, room_id: Uuid) -> Arc<Mutex<()>> {
        self.submit_locks
            .entry(room_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn room_for_write(&self, room_id: Uuid, sender: &Identity) -> Result<Room> {
        let room = self
            .timed(self.store.room(room_id))
            .await?
            .ok_or(ChatError::RoomNotFound(room_id))?;

        // Write-path membership is enforced uniformly
        if !room.is_member(sender.user_id) {
            return Err(ChatError::Forbidden("sender is not a room member"));
        }
        Ok(room)
    }

    /// Submit a new message to a room.
    ///
    /// Assigns server id and timestamp, persists, bumps the room's
    /// last-activity, fans a `Message` event out to the room's hub, and
    /// arms the vanisher when a vanish duration was requested. Returns
    /// the stored message, which is also echoed to the sender through the
    /// fan-out so every member converges on one object.
    ///
    /// # Errors
    ///
    /// [`ChatError::RoomNotFound`], [`ChatError::Forbidden`] for a
    /// non-member sender, [`ChatError::InvalidTime`] for a zero vanish
    /// duration, [`ChatError::Persistence`] on store failure (nothing is
    /// broadcast in that case).
    pub async fn submit(&self, request: NewMessageRequest) -> Result<StoredMessage> {
        if request.vanish_minutes == Some(0) {
            return Err(ChatError::InvalidTime("vanish duration must be positive"));
        }

        let mut room = self.room_for_write(request.room_id, &request.sender).await?;

        let lock = self.submit_lock(request.room_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let message = StoredMessage {
            id: Uuid::new_v4(),
            kind: request.kind,
            content: request.content,
            metadata: request.metadata,
            room_id: request.room_id,
            sender: request.sender.user_id,
            sender_name: request.sender.username,
            created_at: now,
            pin: None,
            reactions: Vec::new(),
            reply_to: request.reply_to,
            vanish_at: request
                .vanish_minutes
                .map(|m| now + ChronoDuration::minutes(i64::from(m))),
        };

        self.timed(self.store.insert_message(message.clone())).await?;

        room.touch();
        if let Err(e) = self.timed(self.store.update_room(room)).await {
            // The message is durable; a failed activity bump is not fatal
            warn!(room = %request.room_id, error = %e, "Failed to bump room activity");
        }

        let recipients = self
            .hubs
            .broadcast(request.room_id, RoomEvent::Message(message.clone()));
        debug!(
            room = %request.room_id,
            message = %message.id,
            recipients,
            "Message fanned out"
        );

        if let Some(vanish_at) = message.vanish_at {
            self.vanisher.arm_at(message.id, message.room_id, vanish_at);
        }

        Ok(message)
    }

    /// Add a reaction to a message.
    ///
    /// Returns `Ok(false)` with no state change and no broadcast when the
    /// (message, emoji, reactor) tuple already exists.
    ///
    /// # Errors
    ///
    /// [`ChatError::MessageNotFound`], [`ChatError::Forbidden`] for a
    /// non-member reactor, [`ChatError::Persistence`] on store failure.
    pub async fn add_reaction(
        &self,
        message_id: Uuid,
        emoji: &str,
        reactor: &Identity,
    ) -> Result<bool> {
        let mut message = self
            .timed(self.store.message(message_id))
            .await?
            .ok_or(ChatError::MessageNotFound(message_id))?;
        self.room_for_write(message.room_id, reactor).await?;

        if !message.add_reaction(emoji, reactor.user_id) {
            return Ok(false);
        }

        self.timed(self.store.update_message(message.clone())).await?;
        self.hubs.broadcast(
            message.room_id,
            RoomEvent::ReactionAdded {
                message_id,
                emoji: emoji.to_string(),
                user_id: reactor.user_id,
                username: reactor.username.clone(),
            },
        );
        Ok(true)
    }

    /// Remove a reaction from a message. Mirror of [`Self::add_reaction`];
    /// removing an absent reaction is `Ok(false)` with no broadcast.
    ///
    /// # Errors
    ///
    /// Same as [`Self::add_reaction`].
    pub async fn remove_reaction(
        &self,
        message_id: Uuid,
        emoji: &str,
        reactor: &Identity,
    ) -> Result<bool> {
        let mut message = self
            .timed(self.store.message(message_id))
            .await?
            .ok_or(ChatError::MessageNotFound(message_id))?;
        self.room_for_write(message.room_id, reactor).await?;

        if !message.remove_reaction(emoji, reactor.user_id) {
            return Ok(false);
        }

        self.timed(self.store.update_message(message.clone())).await?;
        self.hubs.broadcast(
            message.room_id,
            RoomEvent::ReactionRemoved {
                message_id,
                emoji: emoji.to_string(),
                user_id: reactor.user_id,
            },
        );
        Ok(true)
    }

    /// Pin a message. Room admins only. Pinning an already-pinned message
    /// is `Ok(false)` with no broadcast.
    ///
    /// # Errors
    ///
    /// [`ChatError::MessageNotFound`], [`ChatError::Forbidden`] for a
    /// non-admin, [`ChatError::Persistence`] on store failure.
    pub async fn pin_message(&self, message_id: Uuid, by: &Identity) -> Result<bool> {
        let mut message = self
            .timed(self.store.message(message_id))
            .await?
            .ok_or(ChatError::MessageNotFound(message_id))?;
        let room = self.room_for_write(message.room_id, by).await?;
        if !room.is_admin(by.user_id) {
            return Err(ChatError::Forbidden("only admins can pin messages"));
        }

        if message.pin.is_some() {
            return Ok(false);
        }

        let pin = PinInfo {
            pinned_by: by.user_id,
            pinned_at: Utc::now(),
        };
        message.pin = Some(pin.clone());
        self.timed(self.store.update_message(message.clone())).await?;
        self.hubs.broadcast(
            message.room_id,
            RoomEvent::Pinned {
                message_id,
                by: pin.pinned_by,
                at: pin.pinned_at,
            },
        );
        Ok(true)
    }

    /// Unpin a message. Mirror of [`Self::pin_message`].
    ///
    /// # Errors
    ///
    /// Same as [`Self::pin_message`].
    pub async fn unpin_message(&self, message_id: Uuid, by: &Identity) -> Result<bool> {
        let mut message = self
            .timed(self.store.message(message_id))
            .await?
            .ok_or(ChatError::MessageNotFound(message_id))?;
        let room = self.room_for_write(message.room_id, by).await?;
        if !room.is_admin(by.user_id) {
            return Err(ChatError::Forbidden("only admins can unpin messages"));
        }

        if message.pin.take().is_none() {
            return Ok(false);
        }

        self.timed(self.store.update_message(message.clone())).await?;
        self.hubs
            .broadcast(message.room_id, RoomEvent::Unpinned { message_id });
        Ok(true)
    }

    /// Explicitly delete a message. Allowed for its sender and for room
    /// admins. Disarms any pending vanish timer first.
    ///
    /// # Errors
    ///
    /// [`ChatError::MessageNotFound`], [`ChatError::Forbidden`],
    /// [`ChatError::Persistence`].
    pub async fn delete_message(&self, message_id: Uuid, by: &Identity) -> Result<()> {
        let message = self
            .timed(self.store.message(message_id))
            .await?
            .ok_or(ChatError::MessageNotFound(message_id))?;
        let room = self.room_for_write(message.room_id, by).await?;
        if message.sender != by.user_id && !room.is_admin(by.user_id) {
            return Err(ChatError::Forbidden(
                "only the sender or an admin can delete a message",
            ));
        }

        self.vanisher.disarm(message_id);
        self.timed(self.store.delete_message(message_id)).await?;
        self.hubs.broadcast(
            message.room_id,
            RoomEvent::MessageDeleted {
                message_id,
                reason: DeleteReason::Deleted,
            },
        );
        Ok(())
    }

    /// Relay a typing indicator to the other live members of a room.
    /// Never persisted; the source connection does not receive the echo.
    pub fn typing(&self, room_id: Uuid, who: &Identity, connection_id: &str, active: bool) {
        self.hubs.broadcast(
            room_id,
            RoomEvent::Typing {
                room_id,
                user_id: who.user_id,
                username: who.username.clone(),
                active,
                source: connection_id.to_string(),
            },
        );
    }

    /// The store this pipeline persists through.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// The hub table this pipeline fans out through.
    #[must_use]
    pub fn hubs(&self) -> &Arc<HubTable> {
        &self.hubs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MessageStore};
    use crate::vanisher::Vanisher;

    struct Fixture {
        pipeline: Arc<Pipeline>,
        hubs: Arc<HubTable>,
        store: Arc<MemoryStore>,
        room: Room,
        member: Identity,
    }

    async fn fixture() -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let hubs = Arc::new(HubTable::new());
        let member = Identity::new(Uuid::new_v4(), "alice");
        let room = Room::new("general", member.user_id);
        store.create_room(room.clone()).await.unwrap();

        let vanisher = Arc::new(Vanisher::new(store.clone(), hubs.clone()));
        let pipeline = Arc::new(Pipeline::new(store.clone(), hubs.clone(), vanisher));
        Fixture {
            pipeline,
            hubs,
            store,
            room,
            member,
        }
    }

    #[tokio::test]
    async fn test_submit_persists_and_fans_out() {
        let fx = fixture().await;
        let mut rx = fx.hubs.join(fx.room.id, "conn-1");

        let stored = fx
            .pipeline
            .submit(NewMessageRequest::text(fx.room.id, fx.member.clone(), "hi"))
            .await
            .unwrap();

        assert_eq!(fx.store.message_count(), 1);

        let event = rx.try_recv().unwrap();
        match event.as_ref() {
            RoomEvent::Message(msg) => {
                assert_eq!(msg.id, stored.id);
                assert_eq!(msg.created_at, stored.created_at);
            }
            other => panic!("expected Message event, got {other:?}"),
        }

        // Last-activity advanced
        let room = fx.store.room(fx.room.id).await.unwrap().unwrap();
        assert!(room.last_activity >= fx.room.last_activity);
    }

    #[tokio::test]
    async fn test_submit_unknown_room() {
        let fx = fixture().await;
        let err = fx
            .pipeline
            .submit(NewMessageRequest::text(
                Uuid::new_v4(),
                fx.member.clone(),
                "hi",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::RoomNotFound(_)));
        assert_eq!(fx.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_non_member() {
        let fx = fixture().await;
        let outsider = Identity::new(Uuid::new_v4(), "mallory");
        let err = fx
            .pipeline
            .submit(NewMessageRequest::text(fx.room.id, outsider, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_submit_zero_vanish_rejected() {
        let fx = fixture().await;
        let mut req = NewMessageRequest::text(fx.room.id, fx.member.clone(), "hi");
        req.vanish_minutes = Some(0);
        assert!(matches!(
            fx.pipeline.submit(req).await,
            Err(ChatError::InvalidTime(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_reaction_is_quiet_noop() {
        let fx = fixture().await;
        let stored = fx
            .pipeline
            .submit(NewMessageRequest::text(fx.room.id, fx.member.clone(), "hi"))
            .await
            .unwrap();

        let mut rx = fx.hubs.join(fx.room.id, "conn-1");

        assert!(fx
            .pipeline
            .add_reaction(stored.id, "👍", &fx.member)
            .await
            .unwrap());
        assert!(!fx
            .pipeline
            .add_reaction(stored.id, "👍", &fx.member)
            .await
            .unwrap());

        // Exactly one broadcast for the two calls
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        let message = fx.store.message(stored.id).await.unwrap().unwrap();
        assert_eq!(message.reactions.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_absent_reaction_is_quiet_noop() {
        let fx = fixture().await;
        let stored = fx
            .pipeline
            .submit(NewMessageRequest::text(fx.room.id, fx.member.clone(), "hi"))
            .await
            .unwrap();

        assert!(!fx
            .pipeline
            .remove_reaction(stored.id, "👍", &fx.member)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_pin_requires_admin() {
        let fx = fixture().await;
        let stored = fx
            .pipeline
            .submit(NewMessageRequest::text(fx.room.id, fx.member.clone(), "hi"))
            .await
            .unwrap();

        // Creator is admin
        assert!(fx.pipeline.pin_message(stored.id, &fx.member).await.unwrap());
        // Re-pin is a quiet no-op
        assert!(!fx.pipeline.pin_message(stored.id, &fx.member).await.unwrap());

        // A plain member cannot pin
        let other = Identity::new(Uuid::new_v4(), "bob");
        let mut room = fx.store.room(fx.room.id).await.unwrap().unwrap();
        room.add_member(other.user_id);
        fx.store.update_room(room).await.unwrap();

        assert!(matches!(
            fx.pipeline.unpin_message(stored.id, &other).await,
            Err(ChatError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_explicit_delete_broadcasts() {
        let fx = fixture().await;
        let stored = fx
            .pipeline
            .submit(NewMessageRequest::text(fx.room.id, fx.member.clone(), "hi"))
            .await
            .unwrap();

        let mut rx = fx.hubs.join(fx.room.id, "conn-1");
        fx.pipeline.delete_message(stored.id, &fx.member).await.unwrap();

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event.as_ref(),
            RoomEvent::MessageDeleted {
                reason: DeleteReason::Deleted,
                ..
            }
        ));
        assert_eq!(fx.store.message_count(), 0);
    }

    #[tokio::test]
    async fn test_typing_skips_source() {
        let fx = fixture().await;
        let mut rx_self = fx.hubs.join(fx.room.id, "conn-1");
        let mut rx_other = fx.hubs.join(fx.room.id, "conn-2");

        fx.pipeline.typing(fx.room.id, &fx.member, "conn-1", true);

        // Both receivers get the event; delivery filtering is by
        // should_deliver_to at the connection task.
        let event = rx_other.try_recv().unwrap();
        assert!(event.should_deliver_to("conn-2"));
        let event = rx_self.try_recv().unwrap();
        assert!(!event.should_deliver_to("conn-1"));
    }
}
