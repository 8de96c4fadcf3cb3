//! Wire representation of an encrypted chat payload.

use serde::{Deserialize, Serialize};

/// An encrypted payload.
///
/// On the wire this is `{"mode": "symmetric" | "asymmetric", "segments": [...]}`.
/// Symmetric segments are `[iv_hex, aad_hex, ciphertext_b64]`; asymmetric
/// segments are ordered base64 ciphertext chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum EncryptedMessage {
    Symmetric {
        iv: String,
        aad: String,
        ciphertext: String,
    },
    Asymmetric {
        chunks: Vec<String>,
    },
}

impl EncryptedMessage {
    /// Ordered wire segments.
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Self::Symmetric {
                iv,
                aad,
                ciphertext,
            } => vec![iv.as_str(), aad.as_str(), ciphertext.as_str()],
            Self::Asymmetric { chunks } => chunks.iter().map(String::as_str).collect(),
        }
    }

    pub const fn is_symmetric(&self) -> bool {
        matches!(self, Self::Symmetric { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WireMode {
    Symmetric,
    Asymmetric,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    mode: WireMode,
    segments: Vec<String>,
}

impl TryFrom<WireMessage> for EncryptedMessage {
    type Error = String;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        match wire.mode {
            WireMode::Symmetric => {
                let [iv, aad, ciphertext]: [String; 3] =
                    wire.segments.try_into().map_err(|s: Vec<String>| {
                        format!("symmetric message needs 3 segments, got {}", s.len())
                    })?;
                Ok(Self::Symmetric {
                    iv,
                    aad,
                    ciphertext,
                })
            }
            WireMode::Asymmetric if wire.segments.is_empty() => {
                Err("asymmetric message needs at least one segment".to_string())
            }
            WireMode::Asymmetric => Ok(Self::Asymmetric {
                chunks: wire.segments,
            }),
        }
    }
}

impl From<EncryptedMessage> for WireMessage {
    fn from(msg: EncryptedMessage) -> Self {
        match msg {
            EncryptedMessage::Symmetric {
                iv,
                aad,
                ciphertext,
            } => Self {
                mode: WireMode::Symmetric,
                segments: vec![iv, aad, ciphertext],
            },
            EncryptedMessage::Asymmetric { chunks } => Self {
                mode: WireMode::Asymmetric,
                segments: chunks,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_wire_shape() {
        let msg = EncryptedMessage::Symmetric {
            iv: "00".into(),
            aad: "11".into(),
            ciphertext: "AA==".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"mode": "symmetric", "segments": ["00", "11", "AA=="]})
        );
        let back: EncryptedMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.segments(), vec!["00", "11", "AA=="]);
    }

    #[test]
    fn symmetric_with_wrong_segment_count_is_rejected() {
        let json = r#"{"mode":"symmetric","segments":["00","11"]}"#;
        let err = serde_json::from_str::<EncryptedMessage>(json).unwrap_err();
        assert!(err.to_string().contains("3 segments"));
    }

    #[test]
    fn asymmetric_requires_a_segment() {
        let json = r#"{"mode":"asymmetric","segments":[]}"#;
        assert!(serde_json::from_str::<EncryptedMessage>(json).is_err());

        let json = r#"{"mode":"asymmetric","segments":["a","b"]}"#;
        let msg: EncryptedMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.is_symmetric());
        assert_eq!(msg.segments(), vec!["a", "b"]);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let json = r#"{"mode":"rot13","segments":["a"]}"#;
        assert!(serde_json::from_str::<EncryptedMessage>(json).is_err());
    }
}
