//! Echoes peer key exchange.
//!
//! Negotiates a session key with each chat peer over an untrusted transport:
//!
//! - **Key exchange family**: both sides send X25519 public keys and derive
//!   the same AES session key independently
//! - **Legacy family**: RSA public keys; the receiver of the first key
//!   generates the session key and sends it back sealed to that key
//!
//! A peer is `oneway` once their key is imported and `encrypted` once the
//! transport has also confirmed delivery of ours. Outbound messages go to an
//! `mpsc` channel owned by the transport; state changes are broadcast.

pub mod error;
pub mod identity;
pub mod manager;
pub mod protocol;
pub mod state;

pub use error::KeyxError;
pub use identity::IdentityProvider;
pub use manager::PeerKeyExchange;
pub use protocol::{
    EchoKind, InboundEcho, ProtocolMessage, StateChange, decode_pubkey, encode_pubkey,
};
pub use state::{EncryptionState, PeerKeyState};
