/// Error kinds surfaced by the crypto collaborators.
///
/// Per-datagram failures here (`AuthenticationFailed`, `InvalidPoint`) are meant to be
/// dropped silently by callers rather than reported, so they never become an oracle for
/// an attacker probing the protocol. See the handshake and transport receive paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The CSPRNG failed to initialize or produce output.
    RngFailure,
    /// A supplied curve point was invalid (identity, wrong subgroup, or malformed encoding).
    InvalidPoint,
    /// AEAD authentication failed; the packet must be dropped without state change.
    AuthenticationFailed,
    /// A key or nonce counter reached its hard usage limit and must not be reused.
    KeyLifetimeExceeded,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RngFailure => f.write_str("RngFailure"),
            Self::InvalidPoint => f.write_str("InvalidPoint"),
            Self::AuthenticationFailed => f.write_str("AuthenticationFailed"),
            Self::KeyLifetimeExceeded => f.write_str("KeyLifetimeExceeded"),
        }
    }
}

impl std::error::Error for CryptoError {}
