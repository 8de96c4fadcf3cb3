//! Per-family key slots owned by a [`crate::CryptoEngine`].

use zeroize::Zeroizing;

use crate::family::KeyFamily;
use crate::keys::{ImportedKey, KeyPair, SecretKey};

/// Locally generated key material.
#[derive(Debug, Clone)]
pub enum GeneratedKey {
    Pair(KeyPair),
    Secret(SecretKey),
}

impl GeneratedKey {
    pub const fn is_extractable(&self) -> bool {
        match self {
            Self::Pair(pair) => pair.extractable,
            Self::Secret(key) => key.is_extractable(),
        }
    }
}

/// Exported forms of the generated key.
#[derive(Clone, Default)]
pub struct ExportedKey {
    /// SPKI PEM of the public half.
    pub public_pem: Option<String>,
    /// PKCS#8 PEM of the private half.
    pub private_pem: Option<Zeroizing<String>>,
    /// Raw hex of a symmetric key.
    pub secret_hex: Option<Zeroizing<String>>,
    /// Grouped display fingerprint of `public_pem`.
    pub fingerprint: Option<String>,
}

impl std::fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |present: bool| if present { Some("[REDACTED]") } else { None };
        f.debug_struct("ExportedKey")
            .field("public_pem", &self.public_pem)
            .field("private_pem", &redact(self.private_pem.is_some()))
            .field("secret_hex", &redact(self.secret_hex.is_some()))
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Generated, exported and imported slots for one key family.
#[derive(Debug, Clone, Default)]
pub struct KeyChainEntry {
    pub generated: Option<GeneratedKey>,
    pub exported: ExportedKey,
    pub imported: Option<ImportedKey>,
}

impl KeyChainEntry {
    /// True when the entry holds no key material at all.
    pub const fn is_empty(&self) -> bool {
        self.generated.is_none()
            && self.imported.is_none()
            && self.exported.public_pem.is_none()
            && self.exported.private_pem.is_none()
            && self.exported.secret_hex.is_none()
    }
}

/// One [`KeyChainEntry`] per [`KeyFamily`].
#[derive(Debug, Clone, Default)]
pub struct KeyChain {
    asymmetric: KeyChainEntry,
    key_exchange: KeyChainEntry,
    symmetric: KeyChainEntry,
}

impl KeyChain {
    pub const fn entry(&self, family: KeyFamily) -> &KeyChainEntry {
        match family {
            KeyFamily::AsymmetricEncrypt => &self.asymmetric,
            KeyFamily::KeyExchange => &self.key_exchange,
            KeyFamily::Symmetric => &self.symmetric,
        }
    }

    pub const fn entry_mut(&mut self, family: KeyFamily) -> &mut KeyChainEntry {
        match family {
            KeyFamily::AsymmetricEncrypt => &mut self.asymmetric,
            KeyFamily::KeyExchange => &mut self.key_exchange,
            KeyFamily::Symmetric => &mut self.symmetric,
        }
    }

    /// Drop every key in every family.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn is_empty(&self) -> bool {
        KeyFamily::ALL
            .into_iter()
            .all(|family| self.entry(family).is_empty())
    }
}
