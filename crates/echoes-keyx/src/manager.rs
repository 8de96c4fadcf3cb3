//! Per-peer key exchange state machine.
//!
//! One [`PeerKeyState`] per peer nickname, each behind its own async mutex so
//! that negotiation steps for the same peer never interleave while different
//! peers proceed independently. Local session key pairs live in a single
//! [`CryptoEngine`]; peer keys are imported into short-lived scratch engines.
//!
//! Lock order is always peer slot, then local engine. Slots whose record
//! ends up empty are dropped from the map.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use echoes_core::KeyxConfig;
use echoes_crypto::{
    CryptoEngine, CryptoError, EncryptedMessage, KeyFamily, KeyPart, PrivateKey, PublicKey,
    SecretKey, format_fingerprint,
};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::KeyxError;
use crate::identity::IdentityProvider;
use crate::protocol::{
    EchoKind, InboundEcho, ProtocolMessage, StateChange, decode_pubkey, encode_pubkey,
};
use crate::state::{EncryptionState, PeerKeyState};

type PeerSlot = Arc<Mutex<PeerKeyState>>;

/// Drives key negotiation with every peer of one chat session.
pub struct PeerKeyExchange {
    config: KeyxConfig,
    identity: Arc<dyn IdentityProvider>,
    outbound_tx: mpsc::Sender<ProtocolMessage>,
    events_tx: broadcast::Sender<StateChange>,
    engine: RwLock<CryptoEngine>,
    peers: RwLock<HashMap<String, PeerSlot>>,
    /// Bumped by `on_session_ended`; operations from an older generation never commit.
    generation: AtomicU64,
}

impl PeerKeyExchange {
    pub fn new(
        config: KeyxConfig,
        identity: Arc<dyn IdentityProvider>,
        outbound_tx: mpsc::Sender<ProtocolMessage>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            identity,
            outbound_tx,
            events_tx,
            engine: RwLock::new(CryptoEngine::new()),
            peers: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Receive a [`StateChange`] after every transition.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events_tx.subscribe()
    }

    /// Family offered to peers we have not negotiated with yet.
    pub const fn preferred_family(&self) -> KeyFamily {
        if self.config.prefers_key_exchange() {
            KeyFamily::KeyExchange
        } else {
            KeyFamily::AsymmetricEncrypt
        }
    }

    // --- Negotiation ---

    /// Send our public key to `peer`, generating a local key first if needed.
    ///
    /// A family already negotiated with the peer wins over `preferred_family`.
    /// Our key only counts as delivered once the transport acknowledges it.
    pub async fn send_key(&self, peer: &str, preferred_family: KeyFamily) -> Result<(), KeyxError> {
        let started = self.current_generation();
        let slot = self.slot(peer).await;
        let result = async {
            let mut state = slot.lock().await;
            self.ensure_current(started)?;

            let family = state.negotiated_family.unwrap_or(preferred_family);
            self.send_key_locked(peer, &mut state, family, started)
                .await
        }
        .await;
        self.prune(peer, slot).await;
        result
    }

    /// The transport confirmed delivery of our `family` key to `peer`.
    pub async fn on_key_send_acknowledged(
        &self,
        peer: &str,
        family: KeyFamily,
    ) -> Result<(), KeyxError> {
        let started = self.current_generation();
        let Some(slot) = self.existing_slot(peer).await else {
            debug!(peer, %family, "Acknowledgement for unknown peer ignored");
            return Ok(());
        };
        let mut state = slot.lock().await;
        self.ensure_current(started)?;

        if state.negotiated_family != Some(family) {
            warn!(
                peer,
                %family,
                negotiated = ?state.negotiated_family,
                "Ignoring acknowledgement for a family that is not negotiated"
            );
            return Ok(());
        }

        state.local_key_acknowledged_sent = true;
        self.notify(peer, &state);
        info!(peer, %family, "Public key delivered");
        Ok(())
    }

    /// Import a peer's public key and establish the session key.
    ///
    /// Any failure clears the peer's record entirely.
    pub async fn on_key_received(
        &self,
        peer: &str,
        family: KeyFamily,
        exported_public_key: &str,
        wrapped_symmetric_key: Option<Vec<String>>,
    ) -> Result<(), KeyxError> {
        if family == KeyFamily::Symmetric {
            return Err(KeyxError::UnsupportedFamily(family));
        }
        if family == KeyFamily::KeyExchange && !self.config.key_exchange_supported {
            warn!(peer, "Key exchange family not supported, notifying peer");
            return self
                .emit(ProtocolMessage::KeyxUnsupported {
                    to: peer.to_string(),
                    from: self.local_name(),
                })
                .await;
        }

        let started = self.current_generation();
        let slot = self.slot(peer).await;
        let result = async {
            let mut state = slot.lock().await;
            self.ensure_current(started)?;

            let imported = self
                .import_peer_key(
                    peer,
                    &state,
                    family,
                    exported_public_key,
                    wrapped_symmetric_key,
                )
                .await;

            match imported {
                Ok(next) => {
                    self.ensure_current(started)?;
                    info!(
                        peer,
                        %family,
                        fingerprint = next.peer_fingerprint.as_deref().unwrap_or_default(),
                        "Imported peer public key"
                    );
                    *state = next;
                    self.notify(peer, &state);
                    Ok(())
                }
                Err(e) => {
                    warn!(peer, %family, error = %e, "Peer key import failed, clearing state");
                    if self.is_current(started) {
                        state.clear();
                        self.notify(peer, &state);
                    }
                    Err(e)
                }
            }
        }
        .await;
        self.prune(peer, slot).await;
        result
    }

    /// The peer cannot use the family we offered: fall back to the legacy
    /// family and send a fresh key.
    pub async fn on_key_rejected_unsupported(&self, peer: &str) -> Result<(), KeyxError> {
        let started = self.current_generation();
        let slot = self.slot(peer).await;
        let result = async {
            let mut state = slot.lock().await;
            self.ensure_current(started)?;

            let rejected = state.negotiated_family;
            state.clear();
            self.notify(peer, &state);

            if rejected == Some(KeyFamily::AsymmetricEncrypt) {
                warn!(peer, "Peer rejected the legacy family, no fallback left");
                return Err(KeyxError::UnsupportedFamily(KeyFamily::AsymmetricEncrypt));
            }

            info!(peer, "Peer does not support key exchange, falling back to legacy family");
            self.send_key_locked(peer, &mut state, KeyFamily::AsymmetricEncrypt, started)
                .await
        }
        .await;
        self.prune(peer, slot).await;
        result
    }

    /// Forget everything negotiated with `peer`, optionally telling them.
    pub async fn turn_off(&self, peer: &str, notify_peer: bool) -> Result<(), KeyxError> {
        match self.existing_slot(peer).await {
            Some(slot) => {
                {
                    let mut state = slot.lock().await;
                    state.clear();
                    self.notify(peer, &state);
                }
                self.prune(peer, slot).await;
            }
            None => self.notify(peer, &PeerKeyState::default()),
        }
        info!(peer, notify_peer, "Encryption turned off");

        if notify_peer {
            self.emit(ProtocolMessage::KeyxOff {
                to: peer.to_string(),
                from: self.local_name(),
            })
            .await?;
        }
        Ok(())
    }

    pub async fn on_peer_disconnected(&self, peer: &str) -> Result<(), KeyxError> {
        self.turn_off(peer, false).await
    }

    /// Wipe every peer record and the local session keys.
    ///
    /// Waits for in-flight per-peer operations; those that have not committed
    /// by then fail with [`KeyxError::SessionEnded`].
    pub async fn on_session_ended(&self) {
        // Bumped under the engine lock: any operation that observes the new
        // generation only ever sees the wiped engine.
        {
            let mut engine = self.engine.write().await;
            self.generation.fetch_add(1, Ordering::AcqRel);
            engine.clear();
        }
        let drained: Vec<(String, PeerSlot)> = self.peers.write().await.drain().collect();

        for (peer, slot) in &drained {
            let mut state = slot.lock().await;
            state.clear();
            self.notify(peer, &state);
        }

        info!(peers = drained.len(), "Session ended, peer keys wiped");
    }

    // --- Queries ---

    pub async fn encryption_state_of(&self, peer: &str) -> EncryptionState {
        match self.existing_slot(peer).await {
            Some(slot) => slot.lock().await.encryption_state(),
            None => EncryptionState::Unencrypted,
        }
    }

    /// Display fingerprint of the peer's imported key.
    pub async fn peer_fingerprint(&self, peer: &str) -> Option<String> {
        let slot = self.existing_slot(peer).await?;
        slot.lock().await.peer_fingerprint.clone()
    }

    /// Display fingerprint of our exported session key for `family`.
    pub async fn local_fingerprint(&self, family: KeyFamily) -> Option<String> {
        self.engine.read().await.exported(family).fingerprint.clone()
    }

    pub async fn negotiated_family(&self, peer: &str) -> Option<KeyFamily> {
        let slot = self.existing_slot(peer).await?;
        slot.lock().await.negotiated_family
    }

    pub async fn has_session_key(&self, peer: &str) -> bool {
        match self.existing_slot(peer).await {
            Some(slot) => slot.lock().await.symmetric_key.is_some(),
            None => false,
        }
    }

    /// Peers with a non-empty record, sorted.
    pub async fn active_peers(&self) -> Vec<String> {
        let slots: Vec<(String, PeerSlot)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(peer, slot)| (peer.clone(), Arc::clone(slot)))
            .collect();

        let mut active = Vec::new();
        for (peer, slot) in slots {
            if !slot.lock().await.is_empty() {
                active.push(peer);
            }
        }
        active.sort();
        active
    }

    // --- Message path ---

    /// Encrypt `plaintext` for `peer` with the negotiated key material.
    ///
    /// Failures leave the negotiated state untouched.
    pub async fn send_encrypted(
        &self,
        peer: &str,
        plaintext: &str,
    ) -> Result<EncryptedMessage, KeyxError> {
        let slot = self.existing_slot(peer).await.ok_or_else(|| no_key(peer))?;
        let state = slot.lock().await;
        let public = usable_peer_key(peer, &state)?;

        let message = CryptoEngine::new()
            .encrypt(plaintext, Some(public), state.symmetric_key.as_ref())
            .await
            .inspect_err(|e| warn!(peer, error = %e, "Encrypt failed"))?;
        drop(state);
        Ok(message)
    }

    /// Decrypt a message from `peer` with the negotiated key material.
    ///
    /// Failures leave the negotiated state untouched.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn receive_encrypted(
        &self,
        peer: &str,
        message: &EncryptedMessage,
    ) -> Result<String, KeyxError> {
        let slot = self.existing_slot(peer).await.ok_or_else(|| no_key(peer))?;
        let state = slot.lock().await;
        usable_peer_key(peer, &state)?;

        let engine = self.engine.read().await;
        let private = state
            .negotiated_family
            .and_then(|family| engine.generated_private_key(family));

        let text = CryptoEngine::new()
            .decrypt(message, private, state.symmetric_key.as_ref())
            .await
            .inspect_err(|e| warn!(peer, error = %e, "Decrypt failed"))?;
        Ok(text)
    }

    /// Encrypt `plaintext` for `peer` and emit it as an `echo`.
    pub async fn send_echo(&self, peer: &str, plaintext: &str) -> Result<(), KeyxError> {
        let payload = self.send_encrypted(peer, plaintext).await?;
        self.emit(ProtocolMessage::Echo {
            to: peer.to_string(),
            from: self.local_name(),
            kind: EchoKind::Encrypted,
            payload,
        })
        .await
    }

    /// Route an inbound protocol message. Returns the plaintext of encrypted echoes.
    pub async fn handle_message(
        &self,
        message: ProtocolMessage,
    ) -> Result<Option<InboundEcho>, KeyxError> {
        let me = self.local_name();
        match message {
            ProtocolMessage::KeyxSent { to, family } => {
                self.on_key_send_acknowledged(&to, family).await?;
                Ok(None)
            }
            other if other.recipient() != me => {
                warn!(
                    to = other.recipient(),
                    event = other.event_name(),
                    "Ignoring message addressed to someone else"
                );
                Ok(None)
            }
            ProtocolMessage::Keyx {
                from,
                pubkey,
                family,
                wrapped_symmetric_key,
                ..
            } => {
                let pem = match decode_pubkey(&pubkey) {
                    Ok(pem) => pem,
                    Err(e) => {
                        warn!(peer = %from, error = %e, "Malformed public key, clearing state");
                        self.turn_off(&from, false).await?;
                        return Err(e.into());
                    }
                };
                self.on_key_received(&from, family, &pem, wrapped_symmetric_key)
                    .await?;
                Ok(None)
            }
            ProtocolMessage::KeyxUnsupported { from, .. } => {
                self.on_key_rejected_unsupported(&from).await?;
                Ok(None)
            }
            ProtocolMessage::KeyxOff { from, .. } => {
                info!(peer = %from, "Peer turned encryption off");
                self.turn_off(&from, false).await?;
                Ok(None)
            }
            ProtocolMessage::Echo { from, payload, .. } => {
                let text = self.receive_encrypted(&from, &payload).await?;
                Ok(Some(InboundEcho { from, text }))
            }
        }
    }

    // --- Internals ---

    async fn send_key_locked(
        &self,
        peer: &str,
        state: &mut PeerKeyState,
        family: KeyFamily,
        started: u64,
    ) -> Result<(), KeyxError> {
        let family = self.usable_family(family)?;
        let pem = self.local_public_pem(family, started).await?;

        let mut next = if state.negotiated_family == Some(family) {
            state.clone()
        } else {
            PeerKeyState::default()
        };
        next.negotiated_family = Some(family);

        if let Err(e) = self.prepare_outgoing(peer, &mut next, family).await {
            warn!(peer, %family, error = %e, "Key negotiation failed, clearing state");
            if self.is_current(started) {
                state.clear();
                self.notify(peer, state);
            }
            return Err(e);
        }
        self.ensure_current(started)?;

        let wrapped_symmetric_key = next.wrapped_symmetric_key.clone();
        *state = next;
        self.notify(peer, state);

        info!(
            peer,
            %family,
            wrapped = wrapped_symmetric_key.is_some(),
            "Sending public key"
        );
        self.emit(ProtocolMessage::Keyx {
            to: peer.to_string(),
            from: self.local_name(),
            pubkey: encode_pubkey(&pem),
            family,
            wrapped_symmetric_key,
        })
        .await
    }

    /// Finish whatever the peer's key left pending now that our key exists:
    /// a deferred derivation, or sealing the legacy session key for the peer.
    async fn prepare_outgoing(
        &self,
        peer: &str,
        next: &mut PeerKeyState,
        family: KeyFamily,
    ) -> Result<(), KeyxError> {
        match family {
            KeyFamily::KeyExchange if next.symmetric_key.is_none() => {
                if next.peer_public_key.is_some() {
                    let engine = self.engine.read().await;
                    let key = engine.derive_shared_key(
                        engine.generated_private_key(KeyFamily::KeyExchange),
                        next.peer_public_key.as_ref(),
                        false,
                    )?;
                    drop(engine);
                    next.symmetric_key = Some(key);
                    debug!(peer, "Derived deferred session key");
                }
            }
            KeyFamily::AsymmetricEncrypt if next.wrapped_symmetric_key.is_none() => {
                if let (Some(key), Some(public)) = (&next.symmetric_key, &next.peer_public_key) {
                    let wrapped = wrap_symmetric_key(key, public).await?;
                    next.wrapped_symmetric_key = Some(wrapped);
                    debug!(peer, "Sealed session key for peer");
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn import_peer_key(
        &self,
        peer: &str,
        current: &PeerKeyState,
        family: KeyFamily,
        pem: &str,
        wrapped_symmetric_key: Option<Vec<String>>,
    ) -> Result<PeerKeyState, KeyxError> {
        let mut scratch = CryptoEngine::new();
        let public = scratch.import_key(family, pem, false)?.into_public()?;
        let fingerprint = format_fingerprint(&scratch.hash(pem));

        let same_family = current.negotiated_family == Some(family);
        let same_key = same_family && current.peer_public_key.as_ref() == Some(&public);
        let mut next = if same_family {
            current.clone()
        } else {
            PeerKeyState::default()
        };
        if !same_key {
            next.symmetric_key = None;
            next.wrapped_symmetric_key = None;
        }
        next.negotiated_family = Some(family);
        next.peer_fingerprint = Some(fingerprint);

        match (family, wrapped_symmetric_key) {
            (KeyFamily::KeyExchange, _) => {
                let engine = self.engine.read().await;
                match engine.generated_private_key(KeyFamily::KeyExchange) {
                    Some(private) if next.symmetric_key.is_none() => {
                        next.symmetric_key =
                            Some(scratch.derive_shared_key(Some(private), Some(&public), false)?);
                        debug!(peer, "Derived session key");
                    }
                    Some(_) => {}
                    None => debug!(peer, "No local key-exchange key yet, derivation deferred"),
                }
            }
            (_, Some(chunks)) => {
                let engine = self.engine.read().await;
                let key = unwrap_symmetric_key(
                    chunks,
                    engine.generated_private_key(KeyFamily::AsymmetricEncrypt),
                )
                .await?;
                drop(engine);
                next.symmetric_key = Some(key);
                next.wrapped_symmetric_key = None;
                debug!(peer, "Recovered session key sent by peer");
            }
            (_, None) if next.symmetric_key.is_none() => {
                scratch.generate_key(KeyFamily::Symmetric, true).await?;
                let key = scratch.generated_secret_key().cloned().ok_or_else(|| {
                    CryptoError::CryptoBackendFailure("session key was not generated".to_string())
                })?;
                next.wrapped_symmetric_key = Some(wrap_symmetric_key(&key, &public).await?);
                next.symmetric_key = Some(key);
                debug!(peer, "Generated session key for peer");
            }
            (_, None) => {}
        }

        next.peer_public_key = Some(public);
        Ok(next)
    }

    /// Our exported public key for `family`, generating the pair on first use.
    ///
    /// The pair is generated in a scratch engine so the local engine stays
    /// available to other peers meanwhile. When two peers race, the first
    /// key installed wins.
    async fn local_public_pem(&self, family: KeyFamily, started: u64) -> Result<String, KeyxError> {
        let cached = self.engine.read().await.exported(family).public_pem.clone();
        if let Some(pem) = cached {
            self.ensure_current(started)?;
            return Ok(pem);
        }

        let mut scratch = CryptoEngine::new();
        scratch.generate_key(family, false).await?;
        scratch.export_key(family, KeyPart::Public)?;

        let mut engine = self.engine.write().await;
        self.ensure_current(started)?;
        if engine.exported(family).public_pem.is_none() {
            engine.adopt_generated(family, scratch);
            info!(
                %family,
                fingerprint = engine.exported(family).fingerprint.as_deref().unwrap_or_default(),
                "Local session key ready"
            );
        }
        engine.exported(family).public_pem.clone().ok_or_else(|| {
            KeyxError::Crypto(CryptoError::CryptoBackendFailure(format!(
                "{family} public key was not exported"
            )))
        })
    }

    fn usable_family(&self, family: KeyFamily) -> Result<KeyFamily, KeyxError> {
        match family {
            KeyFamily::Symmetric => Err(KeyxError::UnsupportedFamily(family)),
            KeyFamily::KeyExchange if !self.config.key_exchange_supported => {
                debug!("Key exchange unsupported locally, using legacy family");
                Ok(KeyFamily::AsymmetricEncrypt)
            }
            _ => Ok(family),
        }
    }

    async fn slot(&self, peer: &str) -> PeerSlot {
        if let Some(slot) = self.peers.read().await.get(peer) {
            return Arc::clone(slot);
        }
        let mut peers = self.peers.write().await;
        Arc::clone(peers.entry(peer.to_string()).or_default())
    }

    async fn existing_slot(&self, peer: &str) -> Option<PeerSlot> {
        self.peers.read().await.get(peer).map(Arc::clone)
    }

    /// Remove `peer`'s slot if its record is empty and nobody else holds it.
    ///
    /// Must be called without the slot locked. Under the map's write lock no
    /// new handle can be taken, so a strong count of two (map plus `slot`)
    /// means no operation is waiting on it.
    async fn prune(&self, peer: &str, slot: PeerSlot) {
        let is_empty = |slot: &PeerSlot| slot.try_lock().is_ok_and(|state| state.is_empty());
        if !is_empty(&slot) {
            return;
        }
        let mut peers = self.peers.write().await;
        let mapped = peers
            .get(peer)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if mapped && Arc::strong_count(&slot) == 2 && is_empty(&slot) {
            peers.remove(peer);
            debug!(peer, "Dropped empty peer record");
        }
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn is_current(&self, started: u64) -> bool {
        self.current_generation() == started
    }

    fn ensure_current(&self, started: u64) -> Result<(), KeyxError> {
        if self.is_current(started) {
            Ok(())
        } else {
            Err(KeyxError::SessionEnded)
        }
    }

    fn notify(&self, peer: &str, state: &PeerKeyState) {
        let state = state.encryption_state();
        debug!(peer, %state, "Encryption state");
        // No subscribers is fine
        let _ = self.events_tx.send(StateChange {
            peer: peer.to_string(),
            state,
        });
    }

    async fn emit(&self, message: ProtocolMessage) -> Result<(), KeyxError> {
        let event = message.event_name();
        self.outbound_tx
            .send(message)
            .await
            .map_err(|e| KeyxError::Transport(format!("failed to emit {event}: {e}")))
    }

    fn local_name(&self) -> String {
        self.identity.local_identity_name()
    }
}

fn no_key(peer: &str) -> KeyxError {
    KeyxError::Crypto(CryptoError::NoKeyAvailable(format!(
        "no negotiated key for {peer}, initiate a key exchange"
    )))
}

/// The peer's public key, provided negotiation got far enough to use it.
fn usable_peer_key<'a>(peer: &str, state: &'a PeerKeyState) -> Result<&'a PublicKey, KeyxError> {
    let public = state.peer_public_key.as_ref().ok_or_else(|| no_key(peer))?;
    if state.negotiated_family == Some(KeyFamily::KeyExchange) && state.symmetric_key.is_none() {
        return Err(no_key(peer));
    }
    Ok(public)
}

/// Seal a legacy session key for the holder of `public`.
async fn wrap_symmetric_key(key: &SecretKey, public: &PublicKey) -> Result<Vec<String>, KeyxError> {
    let hex_key = key.to_hex()?;
    match CryptoEngine::new().encrypt(&hex_key, Some(public), None).await? {
        EncryptedMessage::Asymmetric { chunks } => Ok(chunks),
        EncryptedMessage::Symmetric { .. } => Err(KeyxError::Crypto(
            CryptoError::CryptoBackendFailure("session key was not sealed asymmetrically".into()),
        )),
    }
}

/// Recover a legacy session key sealed for us.
async fn unwrap_symmetric_key(
    chunks: Vec<String>,
    private: Option<&PrivateKey>,
) -> Result<SecretKey, KeyxError> {
    let mut scratch = CryptoEngine::new();
    let sealed = EncryptedMessage::Asymmetric { chunks };
    let hex_key = scratch.decrypt(&sealed, private, None).await?;
    Ok(scratch
        .import_key(KeyFamily::Symmetric, &hex_key, true)?
        .into_secret()?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use echoes_crypto::fingerprint::fingerprint_of;

    use super::*;

    fn manager(name: &'static str, config: KeyxConfig) -> (PeerKeyExchange, mpsc::Receiver<ProtocolMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (PeerKeyExchange::new(config, Arc::new(name), tx), rx)
    }

    fn sent_key_fingerprint(message: ProtocolMessage) -> String {
        let ProtocolMessage::Keyx { pubkey, .. } = message else {
            panic!("expected a keyx message");
        };
        fingerprint_of(&decode_pubkey(&pubkey).unwrap())
    }

    async fn wait_until_drained(mgr: &PeerKeyExchange) {
        while !mgr.peers.read().await.is_empty() {
            tokio::task::yield_now().await;
        }
    }

    fn end_session(mgr: &Arc<PeerKeyExchange>) -> tokio::task::JoinHandle<()> {
        let mgr = Arc::clone(mgr);
        tokio::spawn(async move { mgr.on_session_ended().await })
    }

    #[tokio::test]
    async fn preferred_family_follows_config() {
        let (mgr, _rx) = manager("alice", KeyxConfig::default());
        assert_eq!(mgr.preferred_family(), KeyFamily::KeyExchange);

        let config = KeyxConfig {
            key_exchange_supported: false,
            ..KeyxConfig::default()
        };
        let (legacy, _rx) = manager("alice", config);
        assert_eq!(legacy.preferred_family(), KeyFamily::AsymmetricEncrypt);
    }

    #[tokio::test]
    async fn send_key_emits_keyx_without_marking_delivered() {
        let (mgr, mut rx) = manager("alice", KeyxConfig::default());
        mgr.send_key("bob", KeyFamily::KeyExchange).await.unwrap();

        let msg = rx.recv().await.unwrap();
        let ProtocolMessage::Keyx {
            to,
            from,
            pubkey,
            family,
            wrapped_symmetric_key,
        } = msg
        else {
            panic!("expected a keyx message");
        };
        assert_eq!((to.as_str(), from.as_str()), ("bob", "alice"));
        assert_eq!(family, KeyFamily::KeyExchange);
        assert!(wrapped_symmetric_key.is_none());
        assert!(decode_pubkey(&pubkey).unwrap().contains("BEGIN PUBLIC KEY"));

        assert_eq!(
            mgr.encryption_state_of("bob").await,
            EncryptionState::Unencrypted
        );
        assert!(mgr.local_fingerprint(KeyFamily::KeyExchange).await.is_some());
    }

    #[tokio::test]
    async fn symmetric_family_cannot_be_negotiated() {
        let (mgr, _rx) = manager("alice", KeyxConfig::default());
        assert!(matches!(
            mgr.send_key("bob", KeyFamily::Symmetric).await,
            Err(KeyxError::UnsupportedFamily(KeyFamily::Symmetric))
        ));
        assert!(matches!(
            mgr.on_key_received("bob", KeyFamily::Symmetric, "", None).await,
            Err(KeyxError::UnsupportedFamily(_))
        ));
    }

    #[tokio::test]
    async fn malformed_key_clears_peer_record() {
        let (mgr, _rx) = manager("alice", KeyxConfig::default());
        let result = mgr
            .on_key_received("bob", KeyFamily::KeyExchange, "garbage", None)
            .await;
        assert!(matches!(
            result,
            Err(KeyxError::Crypto(CryptoError::InvalidKeyMaterial(_)))
        ));
        assert_eq!(
            mgr.encryption_state_of("bob").await,
            EncryptionState::Unencrypted
        );
        assert!(mgr.active_peers().await.is_empty());
    }

    #[tokio::test]
    async fn unsupported_key_exchange_is_reported_back() {
        let config = KeyxConfig {
            key_exchange_supported: false,
            ..KeyxConfig::default()
        };
        let (mgr, mut rx) = manager("bob", config);
        mgr.on_key_received("alice", KeyFamily::KeyExchange, "irrelevant", None)
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ProtocolMessage::KeyxUnsupported {
                to: "alice".into(),
                from: "bob".into()
            }
        );
        assert!(mgr.active_peers().await.is_empty());
    }

    #[tokio::test]
    async fn acknowledgement_for_other_family_is_ignored() {
        let (mgr, _rx) = manager("alice", KeyxConfig::default());
        mgr.send_key("bob", KeyFamily::KeyExchange).await.unwrap();
        mgr.on_key_send_acknowledged("bob", KeyFamily::AsymmetricEncrypt)
            .await
            .unwrap();
        mgr.on_key_send_acknowledged("carol", KeyFamily::KeyExchange)
            .await
            .unwrap();
        assert!(mgr.active_peers().await == vec!["bob".to_string()]);
        assert_eq!(
            mgr.encryption_state_of("carol").await,
            EncryptionState::Unencrypted
        );
    }

    #[tokio::test]
    async fn send_encrypted_without_negotiation_needs_key_exchange() {
        let (mgr, _rx) = manager("alice", KeyxConfig::default());
        let err = mgr.send_encrypted("bob", "hi").await.unwrap_err();
        assert!(err.needs_key_exchange());
    }

    #[tokio::test]
    async fn messages_for_someone_else_are_ignored() {
        let (mgr, _rx) = manager("alice", KeyxConfig::default());
        let result = mgr
            .handle_message(ProtocolMessage::KeyxOff {
                to: "mallory".into(),
                from: "bob".into(),
            })
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn closed_transport_is_reported() {
        let (mgr, rx) = manager("alice", KeyxConfig::default());
        drop(rx);
        assert!(matches!(
            mgr.turn_off("bob", true).await,
            Err(KeyxError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn key_sent_while_session_wipe_is_pending_is_fresh() {
        let (mgr, mut rx) = manager("alice", KeyxConfig::default());
        let mgr = Arc::new(mgr);
        mgr.send_key("bob", KeyFamily::KeyExchange).await.unwrap();
        let old = sent_key_fingerprint(rx.recv().await.unwrap());

        // bob's record stays locked, so the wipe stalls after draining the map
        let bob = mgr.slot("bob").await;
        let held = bob.lock().await;
        let ending = end_session(&mgr);
        wait_until_drained(&mgr).await;

        mgr.send_key("dave", KeyFamily::KeyExchange).await.unwrap();
        let fresh = sent_key_fingerprint(rx.recv().await.unwrap());
        assert_ne!(fresh, old);
        assert_eq!(
            mgr.local_fingerprint(KeyFamily::KeyExchange).await,
            Some(fresh.clone())
        );

        drop(held);
        ending.await.unwrap();
        assert_eq!(
            mgr.local_fingerprint(KeyFamily::KeyExchange).await,
            Some(fresh)
        );
        assert_eq!(mgr.active_peers().await, vec!["dave".to_string()]);
    }

    #[tokio::test]
    async fn in_flight_send_key_fails_once_the_session_ends() {
        let (mgr, mut rx) = manager("alice", KeyxConfig::default());
        let mgr = Arc::new(mgr);
        let bob = mgr.slot("bob").await;
        let held = bob.lock().await;

        let sending = tokio::spawn({
            let mgr = Arc::clone(&mgr);
            async move { mgr.send_key("bob", KeyFamily::KeyExchange).await }
        });
        // Let it read the generation and queue on bob's record
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        let ending = end_session(&mgr);
        wait_until_drained(&mgr).await;
        drop(held);

        assert!(matches!(
            sending.await.unwrap(),
            Err(KeyxError::SessionEnded)
        ));
        ending.await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(mgr.peers.read().await.is_empty());
        assert!(mgr.local_fingerprint(KeyFamily::KeyExchange).await.is_none());
        assert_eq!(
            mgr.encryption_state_of("bob").await,
            EncryptionState::Unencrypted
        );
    }

    #[tokio::test]
    async fn emptied_records_leave_the_peer_map() {
        let (mgr, _rx) = manager("alice", KeyxConfig::default());

        let failed = mgr
            .on_key_received("bob", KeyFamily::KeyExchange, "garbage", None)
            .await;
        assert!(failed.is_err());
        assert!(mgr.peers.read().await.is_empty());

        mgr.send_key("carol", KeyFamily::KeyExchange).await.unwrap();
        assert_eq!(mgr.peers.read().await.len(), 1);
        mgr.turn_off("carol", false).await.unwrap();
        assert!(mgr.peers.read().await.is_empty());

        mgr.send_key("dave", KeyFamily::AsymmetricEncrypt)
            .await
            .unwrap();
        assert!(matches!(
            mgr.on_key_rejected_unsupported("dave").await,
            Err(KeyxError::UnsupportedFamily(KeyFamily::AsymmetricEncrypt))
        ));
        assert!(mgr.peers.read().await.is_empty());
    }

    #[tokio::test]
    async fn pending_local_keygen_does_not_block_other_peers() {
        let (mgr, _rx) = manager("alice", KeyxConfig::default());
        let mgr = Arc::new(mgr);
        mgr.send_key("bob", KeyFamily::KeyExchange).await.unwrap();

        let generating = tokio::spawn({
            let mgr = Arc::clone(&mgr);
            async move { mgr.send_key("carol", KeyFamily::AsymmetricEncrypt).await }
        });
        tokio::task::yield_now().await;

        // The engine is only write-locked to install the finished RSA pair
        let fingerprint = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            mgr.local_fingerprint(KeyFamily::KeyExchange),
        )
        .await
        .unwrap();
        assert!(fingerprint.is_some());

        generating.await.unwrap().unwrap();
        assert!(
            mgr.local_fingerprint(KeyFamily::AsymmetricEncrypt)
                .await
                .is_some()
        );
    }
}
