//! # parley-protocol
//!
//! Wire protocol for the Parley chat engine.
//!
//! Clients and the server exchange [`Frame`]s over a WebSocket. Each frame
//! is MessagePack-encoded and carried behind a 4-byte big-endian length
//! prefix, so several frames can share one transport message and partial
//! reads are handled by the codec.

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::ProtocolError;
pub use frames::{codes, DeleteReason, Frame, FrameType, MessageKind, MessagePayload, ReactionPayload};
pub use version::PROTOCOL_VERSION;
