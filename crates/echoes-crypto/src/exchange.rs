//! X25519 key agreement and session key derivation.
//!
//! The raw shared secret never leaves this module: it is passed through
//! HKDF-SHA256 and truncated to an AES-128 key.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::family::SYMMETRIC_KEY_LEN;
use crate::keys::SecretKey;

/// HKDF info string for session key derivation.
const HKDF_INFO: &[u8] = b"echoes-keyx-session-v1";

/// HKDF salt for domain separation.
const HKDF_SALT: &[u8] = b"echoes-keyx-hkdf-salt-v1";

fn hkdf_derive(shared_secret: &[u8; 32]) -> Result<[u8; SYMMETRIC_KEY_LEN], CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
    let mut key = [0u8; SYMMETRIC_KEY_LEN];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|e| CryptoError::CryptoBackendFailure(format!("HKDF expand: {e}")))?;
    Ok(key)
}

/// Agree on a session key with a peer.
///
/// Both sides arrive at the same key from their own secret and the other's
/// public key. Low-order peer keys are rejected.
pub fn agree(
    local_secret: &StaticSecret,
    peer_public: &PublicKey,
    extractable: bool,
) -> Result<SecretKey, CryptoError> {
    let shared = local_secret.diffie_hellman(peer_public);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKeyMaterial(
            "peer key-exchange key produces a non-contributory secret".to_string(),
        ));
    }
    let mut key_bytes = hkdf_derive(shared.as_bytes())?;
    let key = SecretKey::from_bytes(&key_bytes, extractable);
    key_bytes.zeroize();
    key
}
