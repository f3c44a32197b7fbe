//! Protocol version negotiation.

/// Current protocol version.
///
/// Sent by the client in `connect` and echoed by the server in
/// `connected`. The server refuses handshakes with a higher major
/// version than it understands.
pub const PROTOCOL_VERSION: u8 = 1;

/// Check whether a client-requested version can be served.
#[must_use]
pub fn is_supported(version: u8) -> bool {
    version >= 1 && version <= PROTOCOL_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_support() {
        assert!(is_supported(PROTOCOL_VERSION));
        assert!(!is_supported(0));
        assert!(!is_supported(PROTOCOL_VERSION + 1));
    }
}
