//! Key exchange error types.

use echoes_crypto::{CryptoError, KeyFamily};

/// Errors from peer negotiation and the encrypted message path.
#[derive(Debug, thiserror::Error)]
pub enum KeyxError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The outbound protocol channel is closed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The session ended while the operation was in flight; nothing was committed.
    #[error("Session ended before the operation completed")]
    SessionEnded,

    #[error("Key family not usable for negotiation: {0}")]
    UnsupportedFamily(KeyFamily),
}

impl KeyxError {
    /// True when the caller should (re)start negotiation with `send_key`.
    pub const fn needs_key_exchange(&self) -> bool {
        matches!(self, Self::Crypto(CryptoError::NoKeyAvailable(_)))
    }
}
