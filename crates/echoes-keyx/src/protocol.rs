//! Protocol messages exchanged with peers, and events published to the UI.
//!
//! Messages are transport-agnostic; the `event` tag is the name a transport
//! emits them under.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use echoes_crypto::{CryptoError, EncryptedMessage, KeyFamily};
use serde::{Deserialize, Serialize};

use crate::state::EncryptionState;

/// A key-exchange or encrypted-echo message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// Our public key for `family`, optionally with the legacy session key
    /// sealed for the recipient.
    Keyx {
        to: String,
        from: String,
        /// Base64 of the PEM-encoded public key.
        pubkey: String,
        family: KeyFamily,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wrapped_symmetric_key: Option<Vec<String>>,
    },
    /// Delivery confirmation of a `keyx` sent to `to`.
    KeyxSent { to: String, family: KeyFamily },
    /// `from` cannot negotiate the offered family.
    KeyxUnsupported { to: String, from: String },
    /// `from` turned encryption off.
    KeyxOff { to: String, from: String },
    Echo {
        to: String,
        from: String,
        #[serde(rename = "type")]
        kind: EchoKind,
        payload: EncryptedMessage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoKind {
    Encrypted,
}

impl ProtocolMessage {
    /// Event name for transports that emit `(name, payload)` pairs.
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Keyx { .. } => "keyx",
            Self::KeyxSent { .. } => "keyx_sent",
            Self::KeyxUnsupported { .. } => "keyx_unsupported",
            Self::KeyxOff { .. } => "keyx_off",
            Self::Echo { .. } => "echo",
        }
    }

    /// The nickname this message is addressed to.
    pub fn recipient(&self) -> &str {
        match self {
            Self::Keyx { to, .. }
            | Self::KeyxSent { to, .. }
            | Self::KeyxUnsupported { to, .. }
            | Self::KeyxOff { to, .. }
            | Self::Echo { to, .. } => to,
        }
    }
}

/// Encode PEM text for the `pubkey` field.
pub fn encode_pubkey(pem: &str) -> String {
    STANDARD.encode(pem.as_bytes())
}

/// Decode the `pubkey` field back to PEM text.
pub fn decode_pubkey(encoded: &str) -> Result<String, CryptoError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("invalid pubkey base64: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("pubkey is not PEM text: {e}")))
}

/// Published after every state transition for a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub peer: String,
    pub state: EncryptionState,
}

/// A decrypted echo received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEcho {
    pub from: String,
    pub text: String,
}
