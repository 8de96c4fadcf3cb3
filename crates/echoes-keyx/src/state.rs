//! Per-peer negotiation record and the derived encryption state.

use std::fmt;

use echoes_crypto::{KeyFamily, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

/// Encryption state of a peer's conversation, as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionState {
    /// No public key from the peer.
    Unencrypted,
    /// Peer's key imported, delivery of ours not yet confirmed.
    OneWay,
    /// Peer's key imported and ours confirmed delivered.
    Encrypted,
}

impl fmt::Display for EncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unencrypted => "unencrypted",
            Self::OneWay => "oneway",
            Self::Encrypted => "encrypted",
        })
    }
}

/// Negotiated key material for one peer.
///
/// A record with every field empty is indistinguishable from no record.
#[derive(Debug, Clone, Default)]
pub struct PeerKeyState {
    pub negotiated_family: Option<KeyFamily>,
    pub peer_public_key: Option<PublicKey>,
    /// Grouped display fingerprint of the peer's exported key.
    pub peer_fingerprint: Option<String>,
    /// Derived (key exchange) or transported (legacy) session key.
    pub symmetric_key: Option<SecretKey>,
    pub local_key_acknowledged_sent: bool,
    /// Legacy family: `symmetric_key` sealed for the peer, sent with our next key.
    pub wrapped_symmetric_key: Option<Vec<String>>,
}

impl PeerKeyState {
    pub const fn is_empty(&self) -> bool {
        self.negotiated_family.is_none()
            && self.peer_public_key.is_none()
            && self.peer_fingerprint.is_none()
            && self.symmetric_key.is_none()
            && !self.local_key_acknowledged_sent
            && self.wrapped_symmetric_key.is_none()
    }

    pub const fn encryption_state(&self) -> EncryptionState {
        match (
            self.peer_public_key.is_some(),
            self.local_key_acknowledged_sent,
        ) {
            (false, _) => EncryptionState::Unencrypted,
            (true, false) => EncryptionState::OneWay,
            (true, true) => EncryptionState::Encrypted,
        }
    }

    /// Forget everything about the peer.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use echoes_crypto::KeyPair;

    use super::*;

    fn some_public_key() -> PublicKey {
        KeyPair::generate(KeyFamily::KeyExchange, false)
            .unwrap()
            .public
    }

    #[test]
    fn empty_record_is_unencrypted() {
        let state = PeerKeyState::default();
        assert!(state.is_empty());
        assert_eq!(state.encryption_state(), EncryptionState::Unencrypted);
    }

    #[test]
    fn acknowledgement_alone_does_not_encrypt() {
        let state = PeerKeyState {
            local_key_acknowledged_sent: true,
            ..PeerKeyState::default()
        };
        assert!(!state.is_empty());
        assert_eq!(state.encryption_state(), EncryptionState::Unencrypted);
    }

    #[test]
    fn received_key_is_one_way_until_acknowledged() {
        let mut state = PeerKeyState {
            peer_public_key: Some(some_public_key()),
            ..PeerKeyState::default()
        };
        assert_eq!(state.encryption_state(), EncryptionState::OneWay);

        state.local_key_acknowledged_sent = true;
        assert_eq!(state.encryption_state(), EncryptionState::Encrypted);

        state.clear();
        assert!(state.is_empty());
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&EncryptionState::OneWay).unwrap(),
            "\"oneway\""
        );
        assert_eq!(EncryptionState::Encrypted.to_string(), "encrypted");
    }
}
