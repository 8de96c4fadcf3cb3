//! Key families and their fixed algorithm descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// RSA modulus size for the legacy asymmetric family.
pub const RSA_MODULUS_BITS: usize = 2048;

/// X25519 key length in bytes.
pub const X25519_KEY_LEN: usize = 32;

/// AES-GCM key length in bytes (128-bit key).
pub const SYMMETRIC_KEY_LEN: usize = 16;

/// AES-GCM IV length in bytes (128-bit IV).
pub const IV_LEN: usize = 16;

/// Additional authenticated data length in bytes (128 bits, fresh per message).
pub const AAD_LEN: usize = 16;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Characters of unicode-safe-encoded text per asymmetric segment.
///
/// RSA-2048 with OAEP-SHA256 can seal at most 190 bytes per operation.
pub const ASYMMETRIC_SEGMENT_LEN: usize = 64;

/// The key families the engine manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyFamily {
    /// Legacy asymmetric encryption (RSA-OAEP).
    #[serde(rename = "asym")]
    AsymmetricEncrypt,
    /// Elliptic-curve key agreement (X25519).
    #[serde(rename = "keyx")]
    KeyExchange,
    /// Session AEAD (AES-128-GCM).
    #[serde(rename = "sym")]
    Symmetric,
}

impl KeyFamily {
    pub const ALL: [Self; 3] = [Self::AsymmetricEncrypt, Self::KeyExchange, Self::Symmetric];

    /// Wire identifier for this family.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AsymmetricEncrypt => "asym",
            Self::KeyExchange => "keyx",
            Self::Symmetric => "sym",
        }
    }

    /// Fixed algorithm descriptor for this family.
    pub const fn descriptor(self) -> AlgorithmDescriptor {
        match self {
            Self::AsymmetricEncrypt => AlgorithmDescriptor {
                name: "RSA-OAEP",
                key_bits: RSA_MODULUS_BITS,
                hash: Some("SHA-256"),
                tag_bits: None,
            },
            Self::KeyExchange => AlgorithmDescriptor {
                name: "X25519",
                key_bits: X25519_KEY_LEN * 8,
                hash: Some("SHA-256"),
                tag_bits: None,
            },
            Self::Symmetric => AlgorithmDescriptor {
                name: "AES-GCM",
                key_bits: SYMMETRIC_KEY_LEN * 8,
                hash: None,
                tag_bits: Some(TAG_LEN * 8),
            },
        }
    }

    /// True for families that have a public half which can be sent to a peer.
    pub const fn has_public_key(self) -> bool {
        !matches!(self, Self::Symmetric)
    }
}

impl fmt::Display for KeyFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable algorithm parameters for a key family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmDescriptor {
    pub name: &'static str,
    pub key_bits: usize,
    /// Hash used by OAEP padding or by HKDF after key agreement.
    pub hash: Option<&'static str>,
    pub tag_bits: Option<usize>,
}

/// Which half of a key to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPart {
    Public,
    /// Private key for pair families, the secret key for [`KeyFamily::Symmetric`].
    Private,
}
