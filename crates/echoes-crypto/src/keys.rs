//! Key handles for the three key families.
//!
//! Public keys serialize to SubjectPublicKeyInfo DER, private keys to PKCS#8
//! DER. X25519 keys use the RFC 8410 algorithm identifier.

use pkcs8::der::asn1::{BitStringRef, OctetStringRef};
use pkcs8::der::{Decode, Encode};
use pkcs8::spki::{AlgorithmIdentifierRef, SubjectPublicKeyInfoRef};
use pkcs8::{ObjectIdentifier, PrivateKeyInfo};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use subtle::ConstantTimeEq;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::encoding::{bytes_to_hex, hex_to_bytes};
use crate::error::CryptoError;
use crate::family::{KeyFamily, RSA_MODULUS_BITS, SYMMETRIC_KEY_LEN, X25519_KEY_LEN};

/// id-X25519 (RFC 8410).
const X25519_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.110");

/// RFC 8410 algorithm identifier; parameters must be absent.
const X25519_ALGORITHM: AlgorithmIdentifierRef<'static> = AlgorithmIdentifierRef {
    oid: X25519_OID,
    parameters: None,
};

/// A public key of one of the pair families.
#[derive(Clone, Debug, PartialEq)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
    X25519(x25519_dalek::PublicKey),
}

impl PublicKey {
    pub const fn family(&self) -> KeyFamily {
        match self {
            Self::Rsa(_) => KeyFamily::AsymmetricEncrypt,
            Self::X25519(_) => KeyFamily::KeyExchange,
        }
    }

    /// SubjectPublicKeyInfo DER encoding.
    pub fn to_spki_der(&self) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Rsa(key) => key
                .to_public_key_der()
                .map(|doc| doc.as_bytes().to_vec())
                .map_err(|e| CryptoError::CryptoBackendFailure(format!("RSA SPKI encode: {e}"))),
            Self::X25519(key) => {
                let spki = SubjectPublicKeyInfoRef {
                    algorithm: X25519_ALGORITHM,
                    subject_public_key: BitStringRef::from_bytes(key.as_bytes())
                        .map_err(backend("X25519 SPKI encode"))?,
                };
                spki.to_der().map_err(backend("X25519 SPKI encode"))
            }
        }
    }

    /// Parse a SubjectPublicKeyInfo DER blob for `family`.
    pub fn from_spki_der(family: KeyFamily, der: &[u8]) -> Result<Self, CryptoError> {
        match family {
            KeyFamily::AsymmetricEncrypt => {
                let key = RsaPublicKey::from_public_key_der(der).map_err(|e| {
                    CryptoError::InvalidKeyMaterial(format!("RSA public key: {e}"))
                })?;
                check_modulus(key.size() * 8)?;
                Ok(Self::Rsa(key))
            }
            KeyFamily::KeyExchange => {
                let spki = SubjectPublicKeyInfoRef::from_der(der)
                    .map_err(invalid("X25519 SubjectPublicKeyInfo"))?;
                check_x25519_algorithm(&spki.algorithm)?;
                let raw = spki.subject_public_key.as_bytes().ok_or_else(|| {
                    CryptoError::InvalidKeyMaterial(
                        "X25519 public key is not a whole number of bytes".to_string(),
                    )
                })?;
                let bytes = fixed_key_bytes(raw)?;
                Ok(Self::X25519(x25519_dalek::PublicKey::from(bytes)))
            }
            KeyFamily::Symmetric => Err(CryptoError::InvalidKeyMaterial(
                "symmetric keys have no public half".to_string(),
            )),
        }
    }
}

/// A private key of one of the pair families.
#[derive(Clone)]
pub enum PrivateKey {
    Rsa(Box<RsaPrivateKey>),
    X25519(StaticSecret),
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("family", &self.family())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl PrivateKey {
    pub const fn family(&self) -> KeyFamily {
        match self {
            Self::Rsa(_) => KeyFamily::AsymmetricEncrypt,
            Self::X25519(_) => KeyFamily::KeyExchange,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Rsa(key) => PublicKey::Rsa(RsaPublicKey::from(key.as_ref())),
            Self::X25519(secret) => PublicKey::X25519(x25519_dalek::PublicKey::from(secret)),
        }
    }

    /// PKCS#8 DER encoding, zeroized when dropped.
    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        match self {
            Self::Rsa(key) => key
                .to_pkcs8_der()
                .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
                .map_err(|e| CryptoError::CryptoBackendFailure(format!("RSA PKCS#8 encode: {e}"))),
            Self::X25519(secret) => {
                // RFC 8410 CurvePrivateKey: the raw scalar wrapped in an OCTET STRING
                let curve_key = Zeroizing::new(
                    OctetStringRef::new(secret.as_bytes())
                        .and_then(|octets| octets.to_der())
                        .map_err(backend("X25519 PKCS#8 encode"))?,
                );
                PrivateKeyInfo::new(X25519_ALGORITHM, curve_key.as_slice())
                    .to_der()
                    .map(Zeroizing::new)
                    .map_err(backend("X25519 PKCS#8 encode"))
            }
        }
    }

    /// Parse a PKCS#8 DER blob for `family`.
    pub fn from_pkcs8_der(family: KeyFamily, der: &[u8]) -> Result<Self, CryptoError> {
        match family {
            KeyFamily::AsymmetricEncrypt => {
                let key = RsaPrivateKey::from_pkcs8_der(der).map_err(|e| {
                    CryptoError::InvalidKeyMaterial(format!("RSA private key: {e}"))
                })?;
                check_modulus(key.size() * 8)?;
                Ok(Self::Rsa(Box::new(key)))
            }
            KeyFamily::KeyExchange => {
                let info = PrivateKeyInfo::from_der(der).map_err(invalid("X25519 PKCS#8 key"))?;
                check_x25519_algorithm(&info.algorithm)?;
                let curve_key = OctetStringRef::from_der(info.private_key)
                    .map_err(invalid("X25519 CurvePrivateKey"))?;
                let mut bytes = fixed_key_bytes(curve_key.as_bytes())?;
                let secret = StaticSecret::from(bytes);
                bytes.zeroize();
                Ok(Self::X25519(secret))
            }
            KeyFamily::Symmetric => Err(CryptoError::InvalidKeyMaterial(
                "symmetric keys are imported from raw hex".to_string(),
            )),
        }
    }
}

/// A generated key pair plus its extractability flag.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
    pub extractable: bool,
}

impl KeyPair {
    /// Generate a key pair for a pair family. CPU-heavy for RSA.
    pub fn generate(family: KeyFamily, extractable: bool) -> Result<Self, CryptoError> {
        let private = match family {
            KeyFamily::AsymmetricEncrypt => {
                let key = RsaPrivateKey::new(&mut OsRng, RSA_MODULUS_BITS).map_err(|e| {
                    CryptoError::CryptoBackendFailure(format!("RSA keygen: {e}"))
                })?;
                PrivateKey::Rsa(Box::new(key))
            }
            KeyFamily::KeyExchange => PrivateKey::X25519(StaticSecret::random_from_rng(OsRng)),
            KeyFamily::Symmetric => {
                return Err(CryptoError::InvalidKeyMaterial(
                    "symmetric family generates a secret key, not a pair".to_string(),
                ));
            }
        };
        Ok(Self {
            public: private.public_key(),
            private,
            extractable,
        })
    }
}

/// A 128-bit AES-GCM session key.
///
/// Compared in constant time; zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; SYMMETRIC_KEY_LEN],
    #[zeroize(skip)]
    extractable: bool,
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("extractable", &self.extractable)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl Eq for SecretKey {}

impl SecretKey {
    /// Generate a fresh random key.
    pub fn generate(extractable: bool) -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes, extractable }
    }

    /// Build from raw key bytes.
    pub fn from_bytes(raw: &[u8], extractable: bool) -> Result<Self, CryptoError> {
        if raw.len() != SYMMETRIC_KEY_LEN {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "symmetric key must be {SYMMETRIC_KEY_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let mut bytes = [0u8; SYMMETRIC_KEY_LEN];
        bytes.copy_from_slice(raw);
        Ok(Self { bytes, extractable })
    }

    /// Parse the raw hex export format.
    pub fn from_hex(hex_str: &str, extractable: bool) -> Result<Self, CryptoError> {
        let raw = Zeroizing::new(hex_to_bytes(hex_str)?);
        Self::from_bytes(&raw, extractable)
    }

    /// Export as lowercase hex. Fails for non-extractable keys.
    pub fn to_hex(&self) -> Result<Zeroizing<String>, CryptoError> {
        if !self.extractable {
            return Err(CryptoError::InvalidKeyMaterial(
                "symmetric key is not extractable".to_string(),
            ));
        }
        Ok(Zeroizing::new(bytes_to_hex(&self.bytes)))
    }

    pub const fn is_extractable(&self) -> bool {
        self.extractable
    }

    pub(crate) const fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.bytes
    }
}

/// Key material produced by [`crate::CryptoEngine::import_key`].
#[derive(Clone, Debug)]
pub enum ImportedKey {
    Public(PublicKey),
    Private(PrivateKey),
    Secret(SecretKey),
}

impl ImportedKey {
    pub const fn public(&self) -> Option<&PublicKey> {
        match self {
            Self::Public(key) => Some(key),
            _ => None,
        }
    }

    pub fn into_public(self) -> Result<PublicKey, CryptoError> {
        match self {
            Self::Public(key) => Ok(key),
            _ => Err(CryptoError::InvalidKeyMaterial(
                "expected a public key".to_string(),
            )),
        }
    }

    pub fn into_private(self) -> Result<PrivateKey, CryptoError> {
        match self {
            Self::Private(key) => Ok(key),
            _ => Err(CryptoError::InvalidKeyMaterial(
                "expected a private key".to_string(),
            )),
        }
    }

    pub fn into_secret(self) -> Result<SecretKey, CryptoError> {
        match self {
            Self::Secret(key) => Ok(key),
            _ => Err(CryptoError::InvalidKeyMaterial(
                "expected a symmetric key".to_string(),
            )),
        }
    }
}

fn fixed_key_bytes(raw: &[u8]) -> Result<[u8; X25519_KEY_LEN], CryptoError> {
    <[u8; X25519_KEY_LEN]>::try_from(raw).map_err(|_| {
        CryptoError::InvalidKeyMaterial(format!(
            "X25519 key must be {X25519_KEY_LEN} bytes, got {}",
            raw.len()
        ))
    })
}

fn check_x25519_algorithm(algorithm: &AlgorithmIdentifierRef<'_>) -> Result<(), CryptoError> {
    if algorithm.oid != X25519_OID {
        return Err(CryptoError::InvalidKeyMaterial(format!(
            "expected X25519 algorithm {X25519_OID}, got {}",
            algorithm.oid
        )));
    }
    if algorithm.parameters.is_some() {
        return Err(CryptoError::InvalidKeyMaterial(
            "X25519 algorithm identifier must not carry parameters".to_string(),
        ));
    }
    Ok(())
}

fn invalid(what: &'static str) -> impl Fn(pkcs8::der::Error) -> CryptoError {
    move |e| CryptoError::InvalidKeyMaterial(format!("{what}: {e}"))
}

fn backend(what: &'static str) -> impl Fn(pkcs8::der::Error) -> CryptoError {
    move |e| CryptoError::CryptoBackendFailure(format!("{what}: {e}"))
}

fn check_modulus(bits: usize) -> Result<(), CryptoError> {
    if bits == RSA_MODULUS_BITS {
        Ok(())
    } else {
        Err(CryptoError::InvalidKeyMaterial(format!(
            "RSA modulus must be {RSA_MODULUS_BITS} bits, got {bits}"
        )))
    }
}
