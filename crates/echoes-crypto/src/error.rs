//! Crypto error types.

/// Errors from cryptographic operations.
///
/// Each variant carries the lower-level error text as diagnostic context.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Malformed or missing key input. Caller error; not retried automatically.
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// The underlying cipher or key generator failed. May be retried with a fresh key.
    #[error("Crypto backend failure: {0}")]
    CryptoBackendFailure(String),

    /// Authentication failed or ciphertext is corrupt/truncated. Never retried with the same key.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Encrypt/decrypt attempted before negotiation produced a usable key.
    #[error("No key available: {0}")]
    NoKeyAvailable(String),
}

impl CryptoError {
    /// Whether retrying with freshly negotiated keys can succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::CryptoBackendFailure(_) | Self::NoKeyAvailable(_))
    }
}
