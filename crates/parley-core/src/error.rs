//! Error taxonomy for the chat engine.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the engine.
///
/// Validation failures are returned to the requesting connection only and
/// are never broadcast. Quiet no-ops (duplicate reaction, cancel of an
/// absent entry) are expressed as `false` returns, not as errors.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Handshake lacked or carried an invalid credential.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The same connection id registered twice.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(String),

    /// Unknown room.
    #[error("Room not found: {0}")]
    RoomNotFound(Uuid),

    /// Unknown message.
    #[error("Message not found: {0}")]
    MessageNotFound(Uuid),

    /// Private-room password mismatch, non-member write, or a non-admin
    /// attempting an admin-only mutation.
    #[error("Forbidden: {0}")]
    Forbidden(&'static str),

    /// Schedule or vanish request with a non-future instant or a zero
    /// duration.
    #[error("Invalid time: {0}")]
    InvalidTime(&'static str),

    /// Store unavailable, write failure, or store call timeout.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl ChatError {
    /// The wire error code for this error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            ChatError::Auth(_) => parley_protocol::codes::AUTH,
            ChatError::AlreadyRegistered(_) => parley_protocol::codes::PROTOCOL,
            ChatError::RoomNotFound(_) | ChatError::MessageNotFound(_) => {
                parley_protocol::codes::NOT_FOUND
            }
            ChatError::Forbidden(_) => parley_protocol::codes::FORBIDDEN,
            ChatError::InvalidTime(_) => parley_protocol::codes::INVALID_TIME,
            ChatError::Persistence(_) => parley_protocol::codes::PERSISTENCE,
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            ChatError::Forbidden("wrong password").code(),
            parley_protocol::codes::FORBIDDEN
        );
        assert_eq!(
            ChatError::RoomNotFound(Uuid::nil()).code(),
            parley_protocol::codes::NOT_FOUND
        );
        assert_eq!(
            ChatError::Persistence("store down".into()).code(),
            parley_protocol::codes::PERSISTENCE
        );
    }
}
