//! AES-128-GCM with a 128-bit IV and fresh 128-bit AAD per message.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes128;
use aes_gcm::{AesGcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::encoding::{from_base64, to_base64, uni_decode, uni_encode};
use crate::error::CryptoError;
use crate::family::{AAD_LEN, IV_LEN};
use crate::keys::SecretKey;
use crate::message::EncryptedMessage;

/// AES-128-GCM parameterised for a 16-byte nonce.
type SessionCipher = AesGcm<Aes128, U16>;

fn cipher_for(key: &SecretKey) -> Result<SessionCipher, CryptoError> {
    SessionCipher::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("AES key: {e}")))
}

/// Encrypt `plaintext` under `key`. Every call draws a new IV and AAD.
pub fn seal(key: &SecretKey, plaintext: &str) -> Result<EncryptedMessage, CryptoError> {
    let cipher = cipher_for(key)?;

    let mut iv = [0u8; IV_LEN];
    let mut aad = [0u8; AAD_LEN];
    OsRng.fill_bytes(&mut iv);
    OsRng.fill_bytes(&mut aad);

    let encoded = uni_encode(plaintext);
    let ciphertext = cipher
        .encrypt(
            Nonce::<U16>::from_slice(&iv),
            Payload {
                msg: encoded.as_bytes(),
                aad: &aad,
            },
        )
        .map_err(|e| CryptoError::CryptoBackendFailure(format!("AES-GCM encrypt: {e}")))?;

    Ok(EncryptedMessage::Symmetric {
        iv: hex::encode(iv),
        aad: hex::encode(aad),
        ciphertext: to_base64(&ciphertext),
    })
}

/// Decrypt the three symmetric segments back to text.
pub fn open(key: &SecretKey, iv: &str, aad: &str, ciphertext: &str) -> Result<String, CryptoError> {
    let cipher = cipher_for(key)?;
    let iv = decode_fixed(iv, IV_LEN, "IV")?;
    let aad = decode_fixed(aad, AAD_LEN, "AAD")?;
    let ciphertext = from_base64(ciphertext)?;

    let encoded = cipher
        .decrypt(
            Nonce::<U16>::from_slice(&iv),
            Payload {
                msg: &ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed("authentication tag mismatch".to_string()))?;

    let encoded = String::from_utf8(encoded)
        .map_err(|e| CryptoError::DecryptionFailed(format!("plaintext is not UTF-8: {e}")))?;
    uni_decode(&encoded)
}

fn decode_fixed(hex_str: &str, len: usize, what: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| CryptoError::DecryptionFailed(format!("invalid {what} hex: {e}")))?;
    if bytes.len() != len {
        return Err(CryptoError::DecryptionFailed(format!(
            "{what} must be {len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}
