//! Handshake authentication.
//!
//! The first frame on a connection must be `connect {token}`. The token
//! is an HS256 JWT issued by the account service; this module only
//! verifies it and resolves the stable identity.

use jsonwebtoken::{decode, DecodingKey, Validation};
use parley_core::error::ChatError;
use parley_core::model::Identity;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Uuid,
    /// Display name at issue time.
    pub username: String,
    /// Expiry (seconds since epoch).
    pub exp: usize,
}

/// Verifies handshake tokens against a shared secret.
#[derive(Clone)]
pub struct Authenticator {
    secret: String,
}

impl Authenticator {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Resolve a handshake token to an identity.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Auth`] for a missing, malformed, expired or
    /// mis-signed token.
    pub fn verify(&self, token: &str) -> Result<Identity, ChatError> {
        if token.is_empty() {
            return Err(ChatError::Auth("missing token".into()));
        }

        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| ChatError::Auth(format!("invalid token: {e}")))?;

        Ok(Identity::new(data.claims.sub, data.claims.username))
    }
}
