//! The crypto engine: key generation, export/import, derivation and
//! segmented encryption over a caller-owned [`KeyChain`].
//!
//! CPU-bound work (RSA key generation and every cipher call) runs on the
//! blocking thread pool so async callers are never stalled.

use serde::Serialize;
use tracing::debug;
use zeroize::Zeroizing;

use crate::encoding::{der_to_pem, pem_to_der};
use crate::error::CryptoError;
use crate::family::{KeyFamily, KeyPart};
use crate::fingerprint::{self, fingerprint_of};
use crate::keychain::{ExportedKey, GeneratedKey, KeyChain};
use crate::keys::{ImportedKey, KeyPair, PrivateKey, PublicKey, SecretKey};
use crate::message::EncryptedMessage;
use crate::{asymmetric, exchange, symmetric};

const PUBLIC_LABEL: &str = "PUBLIC KEY";
const PRIVATE_LABEL: &str = "PRIVATE KEY";

/// Owns one keychain. Cheap to construct; callers may use a fresh engine
/// per operation to keep imported material isolated.
#[derive(Debug, Clone, Default)]
pub struct CryptoEngine {
    keychain: KeyChain,
}

async fn run_blocking<T, F>(op: F) -> Result<T, CryptoError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CryptoError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| CryptoError::CryptoBackendFailure(format!("crypto task failed: {e}")))?
}

impl CryptoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn keychain(&self) -> &KeyChain {
        &self.keychain
    }

    /// Generate a key pair (or a secret key for [`KeyFamily::Symmetric`])
    /// and store it, replacing any previous key and its exports.
    pub async fn generate_key(
        &mut self,
        family: KeyFamily,
        extractable: bool,
    ) -> Result<(), CryptoError> {
        let generated = run_blocking(move || match family {
            KeyFamily::Symmetric => Ok(GeneratedKey::Secret(SecretKey::generate(extractable))),
            _ => KeyPair::generate(family, extractable).map(GeneratedKey::Pair),
        })
        .await?;

        let entry = self.keychain.entry_mut(family);
        entry.generated = Some(generated);
        entry.exported = ExportedKey::default();
        debug!(%family, extractable, "Generated key");
        Ok(())
    }

    /// Move `family`'s generated key and its exports out of `source`,
    /// replacing ours. Imported material is left alone.
    pub fn adopt_generated(&mut self, family: KeyFamily, mut source: Self) {
        let from = source.keychain.entry_mut(family);
        let entry = self.keychain.entry_mut(family);
        entry.generated = from.generated.take();
        entry.exported = std::mem::take(&mut from.exported);
    }

    /// Serialize one half of the generated key into the exported slot.
    ///
    /// Public halves also get a display fingerprint. Private halves and
    /// symmetric keys require the key to have been generated extractable.
    pub fn export_key(&mut self, family: KeyFamily, part: KeyPart) -> Result<(), CryptoError> {
        let entry = self.keychain.entry_mut(family);
        let generated = entry.generated.as_ref().ok_or_else(|| {
            CryptoError::InvalidKeyMaterial(format!("no generated {family} key to export"))
        })?;

        match (generated, part) {
            (GeneratedKey::Pair(pair), KeyPart::Public) => {
                let pem = der_to_pem(&pair.public.to_spki_der()?, PUBLIC_LABEL)?;
                let fingerprint = fingerprint_of(&pem);
                debug!(%family, %fingerprint, "Exported public key");
                entry.exported.public_pem = Some(pem);
                entry.exported.fingerprint = Some(fingerprint);
            }
            (GeneratedKey::Pair(pair), KeyPart::Private) => {
                if !pair.extractable {
                    return Err(CryptoError::InvalidKeyMaterial(format!(
                        "{family} private key is not extractable"
                    )));
                }
                let der = pair.private.to_pkcs8_der()?;
                entry.exported.private_pem = Some(Zeroizing::new(der_to_pem(&der, PRIVATE_LABEL)?));
            }
            (GeneratedKey::Secret(key), KeyPart::Private) => {
                entry.exported.secret_hex = Some(key.to_hex()?);
            }
            (GeneratedKey::Secret(_), KeyPart::Public) => {
                return Err(CryptoError::InvalidKeyMaterial(
                    "symmetric keys have no public half".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Parse exported material: PEM for pair families, hex for symmetric.
    ///
    /// The imported key is stored in the family's imported slot and returned.
    pub fn import_key(
        &mut self,
        family: KeyFamily,
        material: &str,
        extractable: bool,
    ) -> Result<ImportedKey, CryptoError> {
        let imported = match family {
            KeyFamily::Symmetric => ImportedKey::Secret(SecretKey::from_hex(material, extractable)?),
            _ => {
                let (label, der) = pem_to_der(material)?;
                let der = Zeroizing::new(der);
                match label.as_str() {
                    PUBLIC_LABEL => ImportedKey::Public(PublicKey::from_spki_der(family, &der)?),
                    PRIVATE_LABEL => {
                        ImportedKey::Private(PrivateKey::from_pkcs8_der(family, &der)?)
                    }
                    other => {
                        return Err(CryptoError::InvalidKeyMaterial(format!(
                            "unexpected PEM label: {other}"
                        )));
                    }
                }
            }
        };
        self.keychain.entry_mut(family).imported = Some(imported.clone());
        debug!(%family, "Imported key");
        Ok(imported)
    }

    /// Hex digest of `data`, for fingerprinting only.
    #[allow(clippy::unused_self)]
    pub fn hash(&self, data: &str) -> String {
        fingerprint::hash(data)
    }

    /// Hex digest of the JSON serialization of `value`.
    #[allow(clippy::unused_self)]
    pub fn hash_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, CryptoError> {
        fingerprint::hash_json(value)
    }

    /// Derive a session key from our key-exchange secret and a peer's public key.
    #[allow(clippy::unused_self)]
    pub fn derive_shared_key(
        &self,
        local_private: Option<&PrivateKey>,
        peer_public: Option<&PublicKey>,
        extractable: bool,
    ) -> Result<SecretKey, CryptoError> {
        match (local_private, peer_public) {
            (Some(PrivateKey::X25519(secret)), Some(PublicKey::X25519(public))) => {
                exchange::agree(secret, public, extractable)
            }
            (None, _) => Err(CryptoError::InvalidKeyMaterial(
                "no local key-exchange private key".to_string(),
            )),
            (_, None) => Err(CryptoError::InvalidKeyMaterial(
                "no peer key-exchange public key".to_string(),
            )),
            _ => Err(CryptoError::InvalidKeyMaterial(
                "derivation requires key-exchange keys".to_string(),
            )),
        }
    }

    /// Encrypt with the symmetric key if given, otherwise for the peer's
    /// asymmetric public key.
    #[allow(clippy::unused_self)]
    pub async fn encrypt(
        &self,
        plaintext: &str,
        peer_public: Option<&PublicKey>,
        symmetric_key: Option<&SecretKey>,
    ) -> Result<EncryptedMessage, CryptoError> {
        let plaintext = Zeroizing::new(plaintext.to_string());
        if let Some(key) = symmetric_key {
            let key = key.clone();
            return run_blocking(move || symmetric::seal(&key, &plaintext)).await;
        }
        match peer_public {
            Some(PublicKey::Rsa(key)) => {
                let key = key.clone();
                run_blocking(move || asymmetric::seal(&key, &plaintext)).await
            }
            Some(PublicKey::X25519(_)) => Err(CryptoError::InvalidKeyMaterial(
                "key-exchange keys cannot encrypt directly".to_string(),
            )),
            None => Err(CryptoError::NoKeyAvailable(
                "no symmetric or public key supplied".to_string(),
            )),
        }
    }

    /// Inverse of [`Self::encrypt`]; the message mode selects the key used.
    #[allow(clippy::unused_self)]
    pub async fn decrypt(
        &self,
        message: &EncryptedMessage,
        private_key: Option<&PrivateKey>,
        symmetric_key: Option<&SecretKey>,
    ) -> Result<String, CryptoError> {
        match message {
            EncryptedMessage::Symmetric {
                iv,
                aad,
                ciphertext,
            } => {
                let key = symmetric_key.cloned().ok_or_else(|| {
                    CryptoError::NoKeyAvailable("symmetric message but no session key".to_string())
                })?;
                let (iv, aad, ciphertext) = (iv.clone(), aad.clone(), ciphertext.clone());
                run_blocking(move || symmetric::open(&key, &iv, &aad, &ciphertext)).await
            }
            EncryptedMessage::Asymmetric { chunks } => match private_key {
                Some(PrivateKey::Rsa(key)) => {
                    let (key, chunks) = (key.clone(), chunks.clone());
                    run_blocking(move || asymmetric::open(&key, &chunks)).await
                }
                Some(PrivateKey::X25519(_)) => Err(CryptoError::InvalidKeyMaterial(
                    "key-exchange keys cannot decrypt directly".to_string(),
                )),
                None => Err(CryptoError::NoKeyAvailable(
                    "asymmetric message but no private key".to_string(),
                )),
            },
        }
    }

    pub const fn has_generated(&self, family: KeyFamily) -> bool {
        self.keychain.entry(family).generated.is_some()
    }

    pub const fn generated_public_key(&self, family: KeyFamily) -> Option<&PublicKey> {
        match &self.keychain.entry(family).generated {
            Some(GeneratedKey::Pair(pair)) => Some(&pair.public),
            _ => None,
        }
    }

    pub const fn generated_private_key(&self, family: KeyFamily) -> Option<&PrivateKey> {
        match &self.keychain.entry(family).generated {
            Some(GeneratedKey::Pair(pair)) => Some(&pair.private),
            _ => None,
        }
    }

    pub const fn generated_secret_key(&self) -> Option<&SecretKey> {
        match &self.keychain.entry(KeyFamily::Symmetric).generated {
            Some(GeneratedKey::Secret(key)) => Some(key),
            _ => None,
        }
    }

    pub const fn exported(&self, family: KeyFamily) -> &ExportedKey {
        &self.keychain.entry(family).exported
    }

    pub const fn imported(&self, family: KeyFamily) -> Option<&ImportedKey> {
        self.keychain.entry(family).imported.as_ref()
    }

    /// Drop all key material held by this engine.
    pub fn clear(&mut self) {
        self.keychain.clear();
    }
}
