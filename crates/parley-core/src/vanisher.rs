//! The vanisher: per-message self-deletion deadlines.
//!
//! Each armed message gets one timer; a 1 Hz sweep force-expires entries
//! whose deadline passed without their timer firing (timer granularity,
//! clock adjustments). The table is purely in-memory: pending entries are
//! lost on process restart. Expiry claims the entry by removing it from
//! the table, so a fire already in flight always wins over a concurrent
//! disarm.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::events::RoomEvent;
use crate::hub::HubTable;
use crate::store::MessageStore;
use parley_protocol::DeleteReason;

/// Default sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Backoff before retrying a fire that hit a store failure.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Default ceiling on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// A pending self-deletion.
#[derive(Debug, Clone)]
pub struct VanishEntry {
    pub message_id: Uuid,
    pub room_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

enum FireOutcome {
    /// Message deleted (or already gone) and broadcast done.
    Done,
    /// Entry was no longer in the table; someone else owns the outcome.
    Gone,
    /// Store failure; entry re-inserted with a pushed deadline.
    Retry,
}

struct Inner {
    entries: DashMap<Uuid, VanishEntry>,
    timers: DashMap<Uuid, JoinHandle<()>>,
    store: Arc<dyn MessageStore>,
    hubs: Arc<HubTable>,
    store_timeout: Duration,
}

impl Inner {
    /// Bound a store call; expiry is a persistence failure.
    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| ChatError::Persistence("store call timed out".into()))?
    }

    /// Claim and execute one expiry. Claiming is by table removal, which
    /// makes concurrent timer/sweep/disarm resolution deterministic.
    async fn try_fire(&self, message_id: Uuid) -> FireOutcome {
        let Some((_, entry)) = self.entries.remove(&message_id) else {
            return FireOutcome::Gone;
        };

        match self.timed(self.store.delete_message(message_id)).await {
            Ok(deleted) => {
                if deleted {
                    self.hubs.broadcast(
                        entry.room_id,
                        RoomEvent::MessageDeleted {
                            message_id,
                            reason: DeleteReason::Vanished,
                        },
                    );
                    debug!(message = %message_id, room = %entry.room_id, "Message vanished");
                }
                FireOutcome::Done
            }
            Err(e) => {
                // Never drop the entry on a failed fire; push the deadline
                // and let the timer loop / sweep retry it.
                warn!(message = %message_id, error = %e, "Vanish fire failed, will retry");
                let retry_at = Utc::now()
                    + ChronoDuration::from_std(RETRY_BACKOFF).unwrap_or(ChronoDuration::zero());
                self.entries.insert(
                    message_id,
                    VanishEntry {
                        expires_at: retry_at,
                        ..entry
                    },
                );
                FireOutcome::Retry
            }
        }
    }
}

/// Process-wide table of pending self-deletions. Cheap to clone; all
/// clones share one table.
#[derive(Clone)]
pub struct Vanisher {
    inner: Arc<Inner>,
}

impl Vanisher {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, hubs: Arc<HubTable>) -> Self {
        Self::with_store_timeout(store, hubs, DEFAULT_STORE_TIMEOUT)
    }

    #[must_use]
    pub fn with_store_timeout(
        store: Arc<dyn MessageStore>,
        hubs: Arc<HubTable>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                timers: DashMap::new(),
                store,
                hubs,
                store_timeout,
            }),
        }
    }

    /// Arm a vanish deadline on a delivered message.
    ///
    /// Persists the deadline on the message, broadcasts `VanishSet` to
    /// the room, and starts the timer. Re-arming replaces any existing
    /// deadline.
    ///
    /// # Errors
    ///
    /// [`ChatError::InvalidTime`] for a zero TTL,
    /// [`ChatError::MessageNotFound`], [`ChatError::Persistence`].
    pub async fn arm(&self, message_id: Uuid, ttl_minutes: u32) -> Result<VanishEntry> {
        if ttl_minutes == 0 {
            return Err(ChatError::InvalidTime("vanish TTL must be positive"));
        }

        let mut message = self
            .inner
            .timed(self.inner.store.message(message_id))
            .await?
            .ok_or(ChatError::MessageNotFound(message_id))?;

        let vanish_at = Utc::now() + ChronoDuration::minutes(i64::from(ttl_minutes));
        message.vanish_at = Some(vanish_at);
        let room_id = message.room_id;
        self.inner
            .timed(self.inner.store.update_message(message))
            .await?;

        self.disarm(message_id);
        let entry = self.insert_and_start(message_id, room_id, vanish_at);

        self.inner.hubs.broadcast(
            room_id,
            RoomEvent::VanishSet {
                message_id,
                vanish_at,
            },
        );
        Ok(entry)
    }

    /// Arm a timer for a message whose deadline is already persisted
    /// (the submit path). No store write, no broadcast.
    pub fn arm_at(&self, message_id: Uuid, room_id: Uuid, vanish_at: DateTime<Utc>) {
        self.insert_and_start(message_id, room_id, vanish_at);
    }

    fn insert_and_start(
        &self,
        message_id: Uuid,
        room_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> VanishEntry {
        let entry = VanishEntry {
            message_id,
            room_id,
            expires_at,
        };
        self.inner.entries.insert(message_id, entry.clone());

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(expires_at) = inner.entries.get(&message_id).map(|e| e.expires_at) else {
                    break;
                };
                let delay = (expires_at - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(delay).await;

                // Deadline may have been pushed by a failed fire
                if inner
                    .entries
                    .get(&message_id)
                    .is_some_and(|e| e.expires_at > Utc::now())
                {
                    continue;
                }

                match inner.try_fire(message_id).await {
                    FireOutcome::Retry => continue,
                    FireOutcome::Done | FireOutcome::Gone => break,
                }
            }
            inner.timers.remove(&message_id);
        });
        self.inner.timers.insert(message_id, handle);

        debug!(message = %message_id, room = %room_id, expires = %expires_at, "Vanish armed");
        entry
    }

    /// Cancel a pending self-deletion. Returns `false` if no entry exists
    /// (already fired or never armed) — not an error.
    pub fn disarm(&self, message_id: Uuid) -> bool {
        // Disarm claims the entry the same way an expiry does: by
        // removing it. If the entry is already gone a fire owns the
        // outcome, and its task must be left alone to finish delete +
        // retraction broadcast; the timer loop exits on its own once the
        // table no longer has the entry.
        if self.inner.entries.remove(&message_id).is_none() {
            return false;
        }
        if let Some((_, handle)) = self.inner.timers.remove(&message_id) {
            handle.abort();
        }
        debug!(message = %message_id, "Vanish disarmed");
        true
    }

    /// Number of pending entries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.entries.len()
    }

    /// Start the 1 Hz safety-net sweep. Force-expires entries whose
    /// deadline has passed but whose timer has not fired.
    pub fn run_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let overdue: Vec<Uuid> = inner
                    .entries
                    .iter()
                    .filter(|e| e.expires_at <= now)
                    .map(|e| e.message_id)
                    .collect();
                for message_id in overdue {
                    let _ = inner.try_fire(message_id).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Identity, NewMessageRequest, Room, StoredMessage};
    use crate::store::{MemoryStore, MessageStore};
    use async_trait::async_trait;
    use parley_protocol::MessageKind;

    /// Wraps the memory store to model a misbehaving backend: deletes
    /// stall for `delete_delay`, then fail outright when `fail_deletes`
    /// is set.
    struct FlakyDeleteStore {
        inner: MemoryStore,
        delete_delay: Duration,
        fail_deletes: bool,
    }

    #[async_trait]
    impl MessageStore for FlakyDeleteStore {
        async fn create_room(&self, room: Room) -> Result<()> {
            self.inner.create_room(room).await
        }

        async fn room(&self, id: Uuid) -> Result<Option<Room>> {
            self.inner.room(id).await
        }

        async fn room_by_name(&self, name: &str) -> Result<Option<Room>> {
            self.inner.room_by_name(name).await
        }

        async fn update_room(&self, room: Room) -> Result<()> {
            self.inner.update_room(room).await
        }

        async fn insert_message(&self, message: StoredMessage) -> Result<()> {
            self.inner.insert_message(message).await
        }

        async fn message(&self, id: Uuid) -> Result<Option<StoredMessage>> {
            self.inner.message(id).await
        }

        async fn update_message(&self, message: StoredMessage) -> Result<()> {
            self.inner.update_message(message).await
        }

        async fn delete_message(&self, id: Uuid) -> Result<bool> {
            tokio::time::sleep(self.delete_delay).await;
            if self.fail_deletes {
                return Err(ChatError::Persistence("delete failed".into()));
            }
            self.inner.delete_message(id).await
        }

        async fn messages_for_room(
            &self,
            room_id: Uuid,
            limit: usize,
        ) -> Result<Vec<StoredMessage>> {
            self.inner.messages_for_room(room_id, limit).await
        }
    }

    async fn seed_message(store: &MemoryStore) -> StoredMessage {
        let sender = Identity::new(Uuid::new_v4(), "alice");
        let room = Room::new("general", sender.user_id);
        let room_id = room.id;
        store.create_room(room).await.unwrap();

        let req = NewMessageRequest::text(room_id, sender, "ephemeral");
        let message = StoredMessage {
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
        };
        store.insert_message(message.clone()).await.unwrap();
        message
    }

    #[tokio::test]
    async fn test_arm_validates_ttl_and_message() {
        let store = Arc::new(MemoryStore::new());
        let hubs = Arc::new(HubTable::new());
        let vanisher = Vanisher::new(store.clone(), hubs);

        assert!(matches!(
            vanisher.arm(Uuid::new_v4(), 0).await,
            Err(ChatError::InvalidTime(_))
        ));
        assert!(matches!(
            vanisher.arm(Uuid::new_v4(), 1).await,
            Err(ChatError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_arm_broadcasts_and_tracks() {
        let store = Arc::new(MemoryStore::new());
        let hubs = Arc::new(HubTable::new());
        let vanisher = Vanisher::new(store.clone(), hubs.clone());
        let message = seed_message(&store).await;

        let mut rx = hubs.join(message.room_id, "conn-1");
        let entry = vanisher.arm(message.id, 1).await.unwrap();
        assert_eq!(entry.room_id, message.room_id);
        assert_eq!(vanisher.pending_count(), 1);

        let event = rx.try_recv().unwrap();
        assert!(matches!(event.as_ref(), RoomEvent::VanishSet { .. }));

        // Deadline persisted on the stored message
        let stored = store.message(message.id).await.unwrap().unwrap();
        assert!(stored.vanish_at.is_some());
    }

    #[tokio::test]
    async fn test_expiry_deletes_and_broadcasts() {
        let store = Arc::new(MemoryStore::new());
        let hubs = Arc::new(HubTable::new());
        let vanisher = Vanisher::new(store.clone(), hubs.clone());
        let message = seed_message(&store).await;

        let mut rx = hubs.join(message.room_id, "conn-1");
        // Short real deadline: arm_at with a sub-second expiry
        vanisher.arm_at(
            message.id,
            message.room_id,
            Utc::now() + ChronoDuration::milliseconds(50),
        );

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(vanisher.pending_count(), 0);
        assert!(store.message(message.id).await.unwrap().is_none());

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.as_ref(),
            RoomEvent::MessageDeleted {
                reason: DeleteReason::Vanished,
                ..
            }
        ));

        // Second deletion attempt for the same id is a no-op
        assert!(!vanisher.disarm(message.id));
    }

    #[tokio::test]
    async fn test_disarm_cancels_pending() {
        let store = Arc::new(MemoryStore::new());
        let hubs = Arc::new(HubTable::new());
        let vanisher = Vanisher::new(store.clone(), hubs.clone());
        let message = seed_message(&store).await;

        vanisher.arm(message.id, 1).await.unwrap();
        assert!(vanisher.disarm(message.id));
        assert!(!vanisher.disarm(message.id));
        assert_eq!(vanisher.pending_count(), 0);

        // Message untouched
        assert!(store.message(message.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_force_expires_overdue() {
        let store = Arc::new(MemoryStore::new());
        let hubs = Arc::new(HubTable::new());
        let vanisher = Vanisher::new(store.clone(), hubs.clone());
        let message = seed_message(&store).await;

        // Insert an already-overdue entry directly, bypassing the timer,
        // to model a timer that never fired.
        vanisher.inner.entries.insert(
            message.id,
            VanishEntry {
                message_id: message.id,
                room_id: message.room_id,
                expires_at: Utc::now() - ChronoDuration::seconds(10),
            },
        );

        let sweeper = vanisher.run_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        sweeper.abort();

        assert_eq!(vanisher.pending_count(), 0);
        assert!(store.message(message.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disarm_during_in_flight_fire_keeps_retraction() {
        let store = Arc::new(FlakyDeleteStore {
            inner: MemoryStore::new(),
            delete_delay: Duration::from_millis(300),
            fail_deletes: false,
        });
        let hubs = Arc::new(HubTable::new());
        let vanisher = Vanisher::new(store.clone(), hubs.clone());
        let message = seed_message(&store.inner).await;

        let mut rx = hubs.join(message.room_id, "conn-1");
        vanisher.arm_at(
            message.id,
            message.room_id,
            Utc::now() + ChronoDuration::milliseconds(50),
        );

        // Let the timer claim the entry; the delete is now in flight
        // inside the stalled store call.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!vanisher.disarm(message.id));

        // The in-flight fire owns the outcome: the message is deleted
        // and the retraction broadcast still reaches the room.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(store.inner.message(message.id).await.unwrap().is_none());
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.as_ref(),
            RoomEvent::MessageDeleted {
                reason: DeleteReason::Vanished,
                ..
            }
        ));
        assert_eq!(vanisher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_hung_store_call_times_out_and_rearms() {
        let store = Arc::new(FlakyDeleteStore {
            inner: MemoryStore::new(),
            delete_delay: Duration::from_secs(30),
            fail_deletes: false,
        });
        let hubs = Arc::new(HubTable::new());
        let vanisher =
            Vanisher::with_store_timeout(store.clone(), hubs.clone(), Duration::from_millis(50));
        let message = seed_message(&store.inner).await;

        let mut rx = hubs.join(message.room_id, "conn-1");
        vanisher.arm_at(message.id, message.room_id, Utc::now());

        tokio::time::sleep(Duration::from_millis(300)).await;

        // The timeout classified the hung delete as a persistence
        // failure: the entry is re-armed with a pushed deadline, the
        // message survives, and nothing was broadcast.
        assert_eq!(vanisher.pending_count(), 1);
        let expires_at = vanisher
            .inner
            .entries
            .get(&message.id)
            .map(|e| e.expires_at)
            .unwrap();
        assert!(expires_at > Utc::now());
        assert!(store.inner.message(message.id).await.unwrap().is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_fire_rearms_with_backoff() {
        let store = Arc::new(FlakyDeleteStore {
            inner: MemoryStore::new(),
            delete_delay: Duration::ZERO,
            fail_deletes: true,
        });
        let hubs = Arc::new(HubTable::new());
        let vanisher = Vanisher::new(store.clone(), hubs.clone());
        let message = seed_message(&store.inner).await;

        let mut rx = hubs.join(message.room_id, "conn-1");
        vanisher.arm_at(message.id, message.room_id, Utc::now());

        tokio::time::sleep(Duration::from_millis(250)).await;

        // The failed fire re-armed the entry instead of dropping it.
        assert_eq!(vanisher.pending_count(), 1);
        let expires_at = vanisher
            .inner
            .entries
            .get(&message.id)
            .map(|e| e.expires_at)
            .unwrap();
        assert!(expires_at > Utc::now());
        assert!(rx.try_recv().is_err());
    }
}
