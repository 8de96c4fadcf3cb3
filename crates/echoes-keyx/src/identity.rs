//! The local identity as seen by the key exchange.
//!
//! Only the display name crosses this boundary; long-term identity keys stay
//! with whoever implements the trait.

/// Supplies the local user's nickname for the `from` field of outgoing messages.
pub trait IdentityProvider: Send + Sync {
    fn local_identity_name(&self) -> String;
}

impl IdentityProvider for String {
    fn local_identity_name(&self) -> String {
        self.clone()
    }
}

impl IdentityProvider for &'static str {
    fn local_identity_name(&self) -> String {
        (*self).to_string()
    }
}
