//! Echoes crypto engine.
//!
//! Key management and message encryption for peer-to-peer chat:
//!
//! - **Legacy asymmetric family**: RSA-OAEP 2048 / SHA-256, segmented
//! - **Key exchange family**: X25519 ECDH → HKDF-SHA256 → session key
//! - **Symmetric family**: AES-128-GCM, fresh 128-bit IV and AAD per message
//!
//! Keys export as PEM (SPKI / PKCS#8) or hex and carry SHA-256 display
//! fingerprints for out-of-band verification.

pub mod asymmetric;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod family;
pub mod fingerprint;
pub mod keychain;
pub mod keys;
pub mod message;
pub mod symmetric;

pub use engine::CryptoEngine;
pub use error::CryptoError;
pub use family::{AlgorithmDescriptor, KeyFamily, KeyPart};
pub use fingerprint::{format_fingerprint, verify_fingerprint};
pub use keychain::{ExportedKey, GeneratedKey, KeyChain, KeyChainEntry};
pub use keys::{ImportedKey, KeyPair, PrivateKey, PublicKey, SecretKey};
pub use message::EncryptedMessage;
