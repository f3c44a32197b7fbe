//! # parley-core
//!
//! The real-time coordination engine for the Parley chat service.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **SessionRegistry** - Live connections and their room memberships
//! - **HubTable / RoomHub** - Per-room live fan-out targets
//! - **Pipeline** - Validate, persist, and fan out messages and reactions
//! - **Scheduler** - Deferred initial delivery of messages
//! - **Vanisher** - Per-message self-deletion deadlines
//! - **MessageStore** - The durable store boundary
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌──────────────┐    ┌──────────┐    ┌─────────┐
//! │ Connection │───▶│   Registry   │───▶│ Pipeline │───▶│ HubTable│
//! └────────────┘    └──────────────┘    └──────────┘    └─────────┘
//!                                         ▲      │
//!                                  ┌──────┘      ▼
//!                              ┌───────────┐ ┌──────────┐
//!                              │ Scheduler │ │ Vanisher │
//!                              └───────────┘ └──────────┘
//! ```
//!
//! The scheduler and vanisher tables are process-local; their pending
//! entries are lost on restart.

pub mod error;
pub mod events;
pub mod hub;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod vanisher;

pub use error::{ChatError, Result};
pub use events::RoomEvent;
pub use hub::{HubTable, RoomHub};
pub use model::{Identity, NewMessageRequest, Reaction, Room, StoredMessage};
pub use pipeline::Pipeline;
pub use registry::{Connection, SessionRegistry};
pub use scheduler::{ScheduledEntry, Scheduler};
pub use store::{MemoryStore, MessageStore};
pub use vanisher::{VanishEntry, Vanisher};
