//! Text and key encodings used on the wire.
//!
//! - unicode-safe transcoding (UTF-8 text -> base64) applied before any
//!   byte-oriented cipher touches chat text
//! - hex for IVs, AAD and raw symmetric keys
//! - PEM framing for DER-encoded public/private keys

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use pkcs8::der::pem::{self, LineEnding};

use crate::error::CryptoError;

/// Transcode arbitrary UTF-8 text into a byte-safe base64 representation.
pub fn uni_encode(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Exact inverse of [`uni_encode`].
pub fn uni_decode(encoded: &str) -> Result<String, CryptoError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::DecryptionFailed(format!("invalid base64 plaintext: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| CryptoError::DecryptionFailed(format!("plaintext is not UTF-8: {e}")))
}

/// Base64-encode bytes for network transfer.
pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 segment received from the network.
pub fn from_base64(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::DecryptionFailed(format!("invalid base64 segment: {e}")))
}

/// Lowercase hex of `bytes`.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Parse a hex string; odd lengths and non-hex digits are rejected.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(hex_str.trim())
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("invalid hex string: {e}")))
}

/// Split `text` into segments of at most `len` characters.
///
/// Empty input yields exactly one empty segment, never zero.
pub fn split_segments(text: &str, len: usize) -> Vec<String> {
    if text.is_empty() || len == 0 {
        return vec![text.to_string()];
    }
    text.chars()
        .collect::<Vec<_>>()
        .chunks(len)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Frame DER bytes as RFC 7468 PEM with the given label (e.g. `"PUBLIC KEY"`).
pub fn der_to_pem(der: &[u8], label: &str) -> Result<String, CryptoError> {
    pem::encode_string(label, LineEnding::LF, der)
        .map_err(|e| CryptoError::CryptoBackendFailure(format!("PEM encode: {e}")))
}

/// Strip PEM framing and decode the DER body.
///
/// Returns the label from the BEGIN marker together with the DER bytes.
pub fn pem_to_der(pem: &str) -> Result<(String, Vec<u8>), CryptoError> {
    let pem = pem.trim();
    if pem.is_empty() {
        return Err(CryptoError::InvalidKeyMaterial(
            "empty key material".to_string(),
        ));
    }
    let (label, der) = pem::decode_vec(pem.as_bytes())
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("invalid PEM: {e}")))?;
    Ok((label.to_string(), der))
}
