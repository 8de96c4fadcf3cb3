//! Fingerprint hashing for out-of-band key verification.
//!
//! Fingerprints are display aids only; nothing authenticates against them.

use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;

/// Hex characters per display group.
const GROUP_LEN: usize = 8;

/// Lowercase SHA-256 hex digest of `data`.
pub fn hash(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Digest of the JSON serialization of `value`.
pub fn hash_json<T: Serialize + ?Sized>(value: &T) -> Result<String, CryptoError> {
    let json = serde_json::to_string(value)
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("unserializable input: {e}")))?;
    Ok(hash(&json))
}

/// Group a hex digest into 8-character blocks separated by spaces.
pub fn format_fingerprint(digest: &str) -> String {
    digest
        .as_bytes()
        .chunks(GROUP_LEN)
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Display fingerprint of an exported key.
pub fn fingerprint_of(exported: &str) -> String {
    format_fingerprint(&hash(exported))
}

/// Constant-time comparison that ignores grouping whitespace and hex case.
pub fn verify_fingerprint(actual: &str, expected: &str) -> bool {
    let normalize = |s: &str| -> Vec<u8> {
        s.bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .map(|b| b.to_ascii_lowercase())
            .collect()
    };
    let (a, b) = (normalize(actual), normalize(expected));
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(&b).into()
}
