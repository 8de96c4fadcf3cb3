//! Segmented RSA-OAEP (SHA-256) encryption.
//!
//! The unicode-safe encoding of the plaintext is cut into fixed-size segments
//! and each segment is sealed on its own, so any length of text fits.

use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::encoding::{from_base64, split_segments, to_base64, uni_decode, uni_encode};
use crate::error::CryptoError;
use crate::family::ASYMMETRIC_SEGMENT_LEN;
use crate::message::EncryptedMessage;

/// Encrypt `plaintext` for the holder of `key`.
pub fn seal(key: &RsaPublicKey, plaintext: &str) -> Result<EncryptedMessage, CryptoError> {
    let encoded = uni_encode(plaintext);
    let chunks = split_segments(&encoded, ASYMMETRIC_SEGMENT_LEN)
        .iter()
        .map(|segment| {
            key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), segment.as_bytes())
                .map(|ct| to_base64(&ct))
                .map_err(|e| CryptoError::CryptoBackendFailure(format!("RSA-OAEP encrypt: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(EncryptedMessage::Asymmetric { chunks })
}

/// Decrypt every chunk in order and reassemble the plaintext.
pub fn open(key: &RsaPrivateKey, chunks: &[String]) -> Result<String, CryptoError> {
    if chunks.is_empty() {
        return Err(CryptoError::DecryptionFailed(
            "asymmetric message has no segments".to_string(),
        ));
    }
    let mut encoded = String::new();
    for (index, chunk) in chunks.iter().enumerate() {
        let ciphertext = from_base64(chunk)?;
        let segment = key
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("segment {index}: {e}")))?;
        let segment = std::str::from_utf8(&segment).map_err(|e| {
            CryptoError::DecryptionFailed(format!("segment {index} is not text: {e}"))
        })?;
        encoded.push_str(segment);
    }
    uni_decode(&encoded)
}
