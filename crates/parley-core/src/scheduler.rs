//! The scheduler: deferred initial delivery of messages.
//!
//! Each accepted entry gets one timer for `fire_at - now`; on expiry the
//! entry is converted into a message request and submitted through the
//! broadcast pipeline. A 1 Hz sweep force-expires entries whose fire-at
//! passed without their timer firing. The table is purely in-memory:
//! pending entries are lost on process restart. Fires claim the entry by
//! removing it from the table, so a fire already in flight always wins
//! over a concurrent cancel.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::model::{Identity, NewMessageRequest};
use crate::pipeline::Pipeline;
use parley_protocol::MessageKind;

/// Backoff before retrying a fire that hit a store failure.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// A message awaiting its delivery instant.
#[derive(Debug, Clone)]
pub struct ScheduledEntry {
    pub id: Uuid,
    pub room_id: Uuid,
    pub author: Identity,
    pub kind: MessageKind,
    pub content: String,
    pub metadata: Option<Value>,
    pub fire_at: DateTime<Utc>,
}

impl ScheduledEntry {
    fn into_request(self) -> NewMessageRequest {
        NewMessageRequest {
            kind: self.kind,
            content: self.content,
            metadata: self.metadata,
            room_id: self.room_id,
            sender: self.author,
            reply_to: None,
            vanish_minutes: None,
        }
    }
}

enum FireOutcome {
    Delivered,
    /// Entry was no longer in the table; someone else owns the outcome.
    Gone,
    /// Submit failed; entry re-inserted with a pushed fire-at.
    Retry,
}

struct Inner {
    entries: DashMap<Uuid, ScheduledEntry>,
    timers: DashMap<Uuid, JoinHandle<()>>,
    pipeline: Arc<Pipeline>,
}

impl Inner {
    async fn try_fire(&self, entry_id: Uuid) -> FireOutcome {
        let Some((_, entry)) = self.entries.remove(&entry_id) else {
            return FireOutcome::Gone;
        };

        let room_id = entry.room_id;
        match self.pipeline.submit(entry.clone().into_request()).await {
            Ok(message) => {
                info!(
                    entry = %entry_id,
                    room = %room_id,
                    message = %message.id,
                    "Scheduled message delivered"
                );
                FireOutcome::Delivered
            }
            Err(e @ ChatError::Persistence(_)) => {
                // Never drop the entry on a failed fire; push fire-at and
                // let the timer loop / sweep retry it.
                warn!(entry = %entry_id, error = %e, "Scheduled fire failed, will retry");
                let retry_at = Utc::now()
                    + ChronoDuration::from_std(RETRY_BACKOFF).unwrap_or(ChronoDuration::zero());
                self.entries.insert(
                    entry_id,
                    ScheduledEntry {
                        fire_at: retry_at,
                        ..entry
                    },
                );
                FireOutcome::Retry
            }
            Err(e) => {
                // Validation failures (room deleted, author removed) can
                // never succeed on retry; drop the entry.
                warn!(entry = %entry_id, error = %e, "Scheduled message rejected, dropping entry");
                FireOutcome::Delivered
            }
        }
    }
}

/// Process-wide table of pending scheduled messages. Cheap to clone; all
/// clones share one table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                timers: DashMap::new(),
                pipeline,
            }),
        }
    }

    /// Accept a deferred message and arm its timer.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidTime`] unless `fire_at` is strictly in
    /// the future.
    pub fn schedule(
        &self,
        room_id: Uuid,
        author: Identity,
        kind: MessageKind,
        content: String,
        metadata: Option<Value>,
        fire_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        if fire_at <= Utc::now() {
            return Err(ChatError::InvalidTime(
                "scheduled time must be in the future",
            ));
        }

        let entry = ScheduledEntry {
            id: Uuid::new_v4(),
            room_id,
            author,
            kind,
            content,
            metadata,
            fire_at,
        };
        let entry_id = entry.id;
        self.inner.entries.insert(entry_id, entry);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(fire_at) = inner.entries.get(&entry_id).map(|e| e.fire_at) else {
                    break;
                };
                let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(delay).await;

                // Fire-at may have been pushed by a failed attempt
                if inner
                    .entries
                    .get(&entry_id)
                    .is_some_and(|e| e.fire_at > Utc::now())
                {
                    continue;
                }

                match inner.try_fire(entry_id).await {
                    FireOutcome::Retry => continue,
                    FireOutcome::Delivered | FireOutcome::Gone => break,
                }
            }
            inner.timers.remove(&entry_id);
        });
        self.inner.timers.insert(entry_id, handle);

        debug!(entry = %entry_id, room = %room_id, fire_at = %fire_at, "Message scheduled");
        Ok(entry_id)
    }

    /// Cancel a pending entry. Returns `false` if it no longer exists
    /// (already fired or already cancelled) — not an error.
    pub fn cancel(&self, entry_id: Uuid) -> bool {
        // Cancel claims the entry the same way a fire does: by removing
        // it. If the entry is already gone a fire owns the outcome, and
        // its task must be left alone to finish persist + broadcast; the
        // timer loop exits on its own once the table no longer has the
        // entry.
        if self.inner.entries.remove(&entry_id).is_none() {
            return false;
        }
        if let Some((_, handle)) = self.inner.timers.remove(&entry_id) {
            handle.abort();
        }
        debug!(entry = %entry_id, "Scheduled message cancelled");
        true
    }

    /// Number of pending entries.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.entries.len()
    }

    /// Pending entries authored by a user. Lets a client list its own
    /// scheduled messages.
    #[must_use]
    pub fn entries_for(&self, user_id: Uuid) -> Vec<ScheduledEntry> {
        self.inner
            .entries
            .iter()
            .filter(|e| e.author.user_id == user_id)
            .map(|e| e.clone())
            .collect()
    }

    /// Start the 1 Hz safety-net sweep. Force-expires entries whose
    /// fire-at has passed but whose timer has not fired.
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
                    .filter(|e| e.fire_at <= now)
                    .map(|e| e.id)
                    .collect();
                for entry_id in overdue {
                    let _ = inner.try_fire(entry_id).await;
                }
            }
        })
    }
}
