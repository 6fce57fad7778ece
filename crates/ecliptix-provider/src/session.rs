//! Per-exchange session: identity keystore + ratchet + peer handshake.
//!
//! Also owns the deterministic id derivations: connect ids from installation
//! settings, logical operation ids from semantic strings, and request keys
//! for duplicate suppression.

use std::sync::Weak;

use sha2::{Digest, Sha256};

use ecliptix_crypto::{
    ExchangeType, IdentityKeystore, RatchetConnection, RatchetMessage,
};
use ecliptix_proto::{
    EnvelopeMetadata, EnvelopeType, PubKeyExchange, SecureEnvelope, SessionState,
};

use crate::events::ProtocolEvents;
use crate::failure::NetworkFailure;
use crate::settings::ApplicationInstanceSettings;
use crate::transport::ServiceType;

/// Low id range reserved for protocol-internal messages.
const RESERVED_OPERATION_IDS: u32 = 1024;

/// Derive the stable session id for `(installation, exchange type)`.
///
/// The hash is collision-resistant in practice, not cryptographically
/// binding; the reverse mapping lives in [`SessionCatalog`], never in a
/// re-derivation.
pub fn derive_connect_id(
    settings: &ApplicationInstanceSettings,
    exchange_type: ExchangeType,
) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(b"ecliptix-connect-id");
    hasher.update(settings.app_instance_id);
    hasher.update(settings.device_id);
    hasher.update([match exchange_type {
        ExchangeType::EphemeralConnect => 1u8,
        ExchangeType::ServerStreaming => 2u8,
    }]);
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Reduce a domain-separated semantic string to a logical operation id,
/// keeping the low range free for protocol ids.
pub(crate) fn operation_id(semantic: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(b"ecliptix-operation-id");
    hasher.update(semantic.as_bytes());
    let digest = hasher.finalize();
    let wide = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    let span = u64::from(u32::MAX - RESERVED_OPERATION_IDS);
    let reduced = (wide % span) as u32;
    reduced.max(RESERVED_OPERATION_IDS)
}

/// The semantic string an operation id is derived from.
pub(crate) fn semantic_operation(
    service: ServiceType,
    connect_id: u32,
    plaintext: &[u8],
    ticks: u64,
) -> String {
    let payload_tag = hex::encode(&Sha256::digest(plaintext)[..8]);
    match service {
        ServiceType::SignInComplete => format!("auth:signin:{connect_id}"),
        ServiceType::SignUpComplete => format!("auth:signup:{connect_id}"),
        s if s.is_stream() => {
            format!("stream:{}:{connect_id}:{ticks}:{payload_tag}", s.wire_name())
        }
        s => format!("data:{}:{connect_id}:{payload_tag}", s.wire_name()),
    }
}

/// Duplicate-suppression key for one logical request.
///
/// Auth-completion services use a fixed suffix so a re-entered completion
/// flow deduplicates regardless of payload differences.
pub(crate) fn request_key(connect_id: u32, service: ServiceType, plaintext: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(b"ecliptix-request-key");
    hasher.update(connect_id.to_be_bytes());
    hasher.update(service.wire_name().as_bytes());
    if service.is_auth_complete() {
        hasher.update(b"complete");
    } else {
        hasher.update(&plaintext[..plaintext.len().min(32)]);
    }
    let digest = hasher.finalize();
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// Authoritative connect-id → exchange-type table, populated at session
/// create time.
pub struct SessionCatalog {
    map: parking_lot::RwLock<std::collections::HashMap<u32, ExchangeType>>,
}

impl SessionCatalog {
    pub fn new() -> Self {
        Self { map: parking_lot::RwLock::new(std::collections::HashMap::new()) }
    }

    pub fn register(&self, connect_id: u32, exchange_type: ExchangeType) {
        self.map.write().insert(connect_id, exchange_type);
    }

    pub fn exchange_type_for(&self, connect_id: u32) -> Option<ExchangeType> {
        self.map.read().get(&connect_id).copied()
    }

    pub fn forget(&self, connect_id: u32) {
        self.map.write().remove(&connect_id);
    }
}

impl Default for SessionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// One protocol session owned by the provider.
pub struct Session {
    connect_id: u32,
    exchange_type: ExchangeType,
    keystore: IdentityKeystore,
    ratchet: RatchetConnection,
    peer_handshake: Option<PubKeyExchange>,
    events: Weak<dyn ProtocolEvents>,
}

impl Session {
    pub fn new(
        connect_id: u32,
        exchange_type: ExchangeType,
        keystore: IdentityKeystore,
        events: Weak<dyn ProtocolEvents>,
    ) -> Self {
        Self {
            connect_id,
            exchange_type,
            keystore,
            ratchet: RatchetConnection::new(connect_id, exchange_type),
            peer_handshake: None,
            events,
        }
    }

    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    pub fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    pub fn is_established(&self) -> bool {
        self.ratchet.is_established()
    }

    pub fn peer_handshake(&self) -> Option<&PubKeyExchange> {
        self.peer_handshake.as_ref()
    }

    /// Discard the ratchet and peer handshake ahead of a re-establishment.
    /// The identity keystore survives.
    pub fn reset_channel(&mut self) {
        self.ratchet = RatchetConnection::new(self.connect_id, self.exchange_type);
        self.peer_handshake = None;
    }

    /// Assemble the local `PubKeyExchange` advertised to the server.
    pub fn begin_exchange(&self) -> PubKeyExchange {
        let bundle = self.keystore.public_bundle();
        PubKeyExchange {
            identity_x25519_pub: bundle.identity_x25519,
            identity_ed25519_pub: bundle.identity_ed25519,
            signed_prekey_pub: bundle.signed_prekey,
            signed_prekey_sig: bundle.signed_prekey_signature,
            one_time_prekey_pubs: bundle.one_time_prekeys.iter().map(|(_, k)| *k).collect(),
            initial_dh_pub: self.ratchet.local_dh_public(),
            exchange_type: self.exchange_type,
        }
    }

    /// Finish the anonymous exchange with the server's bundle.
    pub fn complete_exchange(&mut self, peer: &PubKeyExchange) -> Result<(), NetworkFailure> {
        self.ratchet
            .complete_exchange(&self.keystore, &peer.to_peer_handshake())?;
        self.peer_handshake = Some(peer.clone());
        Ok(())
    }

    /// Finish the authenticated exchange with a master-key-derived root.
    pub fn complete_authenticated_exchange(
        &mut self,
        peer: &PubKeyExchange,
        initial_root_key: [u8; 32],
    ) -> Result<(), NetworkFailure> {
        self.ratchet
            .complete_authenticated_exchange(&peer.to_peer_handshake(), initial_root_key)?;
        self.peer_handshake = Some(peer.clone());
        Ok(())
    }

    /// Seal one plaintext into a `SecureEnvelope`.
    pub fn seal(
        &mut self,
        plaintext: &[u8],
        request_id: u32,
        envelope_type: EnvelopeType,
    ) -> Result<SecureEnvelope, NetworkFailure> {
        let outbound = self.ratchet.produce_outbound(plaintext)?;
        if outbound.ratcheted {
            self.emit(|events| {
                events.on_ratchet_performed(self.connect_id, true, outbound.new_index);
            });
        }
        let message = outbound.message;
        Ok(SecureEnvelope {
            metadata: EnvelopeMetadata {
                request_id,
                nonce: message.nonce.to_vec(),
                ratchet_index: message.ratchet_index,
                envelope_type,
                ratchet_dh_public: message.dh_public.to_vec(),
            },
            encrypted_payload: message.ciphertext,
            authentication_tag: message.tag.to_vec(),
        })
    }

    /// Open one `SecureEnvelope` back into plaintext.
    pub fn open(&mut self, envelope: &SecureEnvelope) -> Result<Vec<u8>, NetworkFailure> {
        let message = ratchet_message_from(envelope)?;
        let inbound = self.ratchet.process_inbound(&message)?;
        if inbound.ratcheted {
            self.emit(|events| {
                events.on_ratchet_performed(self.connect_id, false, inbound.new_index);
            });
        }
        self.emit(|events| {
            events.on_message_processed(self.connect_id, inbound.new_index);
        });
        Ok(inbound.plaintext)
    }

    /// Reconcile chain counters with the server's view.
    pub fn sync_with_remote(
        &mut self,
        server_sending_len: u32,
        server_receiving_len: u32,
    ) -> Result<(), NetworkFailure> {
        let (local_sending, _local_receiving) = self
            .ratchet
            .sync_with_remote(server_sending_len, server_receiving_len)?;
        self.emit(|events| {
            events.on_chain_synchronized(self.connect_id, local_sending, server_sending_len);
        });
        Ok(())
    }

    /// Snapshot the session for persistence. Requires a completed exchange.
    pub fn to_state(&self) -> Result<SessionState, NetworkFailure> {
        let peer_handshake = self.peer_handshake.clone().ok_or_else(|| {
            NetworkFailure::invalid_request("session has no peer handshake to persist")
        })?;
        Ok(SessionState {
            connect_id: self.connect_id,
            identity_keys: self.keystore.to_state(),
            peer_handshake,
            ratchet_state: self.ratchet.to_state(),
        })
    }

    /// Rebuild a session from a persisted record.
    pub fn from_state(
        state: &SessionState,
        events: Weak<dyn ProtocolEvents>,
    ) -> Result<Self, NetworkFailure> {
        let keystore = IdentityKeystore::from_state(&state.identity_keys)?;
        let exchange_type = state.peer_handshake.exchange_type;
        let ratchet =
            RatchetConnection::from_state(state.connect_id, exchange_type, &state.ratchet_state);
        Ok(Self {
            connect_id: state.connect_id,
            exchange_type,
            keystore,
            ratchet,
            peer_handshake: Some(state.peer_handshake.clone()),
            events,
        })
    }

    fn emit(&self, deliver: impl FnOnce(&dyn ProtocolEvents)) {
        match self.events.upgrade() {
            Some(events) => deliver(events.as_ref()),
            None => {
                debug_assert!(false, "session outlived its provider");
                tracing::error!(connect_id = self.connect_id, "event dropped: provider gone");
            }
        }
    }
}

fn ratchet_message_from(envelope: &SecureEnvelope) -> Result<RatchetMessage, NetworkFailure> {
    let nonce: [u8; 12] = envelope
        .metadata
        .nonce
        .as_slice()
        .try_into()
        .map_err(|_| NetworkFailure::protocol_mismatch("envelope nonce must be 12 bytes"))?;
    let dh_public: [u8; 32] = envelope
        .metadata
        .ratchet_dh_public
        .as_slice()
        .try_into()
        .map_err(|_| NetworkFailure::protocol_mismatch("envelope ratchet key must be 32 bytes"))?;
    let tag: [u8; 16] = envelope
        .authentication_tag
        .as_slice()
        .try_into()
        .map_err(|_| NetworkFailure::protocol_mismatch("envelope tag must be 16 bytes"))?;
    Ok(RatchetMessage {
        dh_public,
        ratchet_index: envelope.metadata.ratchet_index,
        nonce,
        ciphertext: envelope.encrypted_payload.clone(),
        tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct RecordingEvents {
        ratchets: parking_lot::Mutex<Vec<(u32, bool, u32)>>,
        synced: parking_lot::Mutex<Vec<(u32, u32, u32)>>,
        processed: parking_lot::Mutex<Vec<(u32, u32)>>,
    }

    impl RecordingEvents {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ratchets: parking_lot::Mutex::new(Vec::new()),
                synced: parking_lot::Mutex::new(Vec::new()),
                processed: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    impl ProtocolEvents for RecordingEvents {
        fn on_ratchet_performed(&self, connect_id: u32, is_sending: bool, new_index: u32) {
            self.ratchets.lock().push((connect_id, is_sending, new_index));
        }

        fn on_chain_synchronized(&self, connect_id: u32, local_len: u32, remote_len: u32) {
            self.synced.lock().push((connect_id, local_len, remote_len));
        }

        fn on_message_processed(&self, connect_id: u32, receiving_index: u32) {
            self.processed.lock().push((connect_id, receiving_index));
        }
    }

    fn events_handle(events: &Arc<RecordingEvents>) -> Weak<dyn ProtocolEvents> {
        let as_dyn: Arc<dyn ProtocolEvents> = Arc::clone(events) as Arc<dyn ProtocolEvents>;
        Arc::downgrade(&as_dyn)
    }

    fn settings() -> ApplicationInstanceSettings {
        ApplicationInstanceSettings::new([1u8; 16], [2u8; 16], "membership-a")
    }

    #[test]
    fn connect_ids_are_stable_and_type_separated() {
        let s = settings();
        let ephemeral = derive_connect_id(&s, ExchangeType::EphemeralConnect);
        let streaming = derive_connect_id(&s, ExchangeType::ServerStreaming);
        assert_ne!(ephemeral, streaming);
        assert_eq!(ephemeral, derive_connect_id(&s, ExchangeType::EphemeralConnect));

        let other = ApplicationInstanceSettings::new([9u8; 16], [2u8; 16], "membership-a");
        assert_ne!(ephemeral, derive_connect_id(&other, ExchangeType::EphemeralConnect));
    }

    #[test]
    fn operation_ids_avoid_the_reserved_range() {
        for seed in 0..200u32 {
            let id = operation_id(&format!("data:ping:{seed}"));
            assert!(id >= RESERVED_OPERATION_IDS);
        }
    }

    #[test]
    fn auth_complete_request_keys_ignore_payload() {
        let a = request_key(42, ServiceType::SignInComplete, b"payload-one");
        let b = request_key(42, ServiceType::SignInComplete, b"payload-two");
        assert_eq!(a, b, "re-entered completion flows deduplicate");

        let c = request_key(42, ServiceType::DataRead, b"payload-one");
        let d = request_key(42, ServiceType::DataRead, b"payload-two");
        assert_ne!(c, d);
    }

    #[test]
    fn semantic_strings_follow_the_domain_scheme() {
        assert_eq!(
            semantic_operation(ServiceType::SignInComplete, 42, b"x", 0),
            "auth:signin:42"
        );
        assert!(semantic_operation(ServiceType::VerificationStream, 42, b"x", 7)
            .starts_with("stream:verification-stream:42:7:"));
        assert!(semantic_operation(ServiceType::Ping, 42, b"x", 0).starts_with("data:ping:42:"));
    }

    #[test]
    fn catalog_is_the_reverse_lookup() {
        let catalog = SessionCatalog::new();
        catalog.register(42, ExchangeType::ServerStreaming);
        assert_eq!(catalog.exchange_type_for(42), Some(ExchangeType::ServerStreaming));
        assert_eq!(catalog.exchange_type_for(43), None);
        catalog.forget(42);
        assert_eq!(catalog.exchange_type_for(42), None);
    }

    #[test]
    fn session_roundtrip_emits_events_and_persists() {
        let client_events = RecordingEvents::new();
        let server_events = RecordingEvents::new();
        let client_dyn = events_handle(&client_events);
        let server_dyn = events_handle(&server_events);

        let mut client = Session::new(
            42,
            ExchangeType::EphemeralConnect,
            IdentityKeystore::create(0).unwrap(),
            client_dyn,
        );
        let mut server = Session::new(
            42,
            ExchangeType::EphemeralConnect,
            IdentityKeystore::create(0).unwrap(),
            server_dyn,
        );

        let client_exchange = client.begin_exchange();
        let server_exchange = server.begin_exchange();
        client.complete_exchange(&server_exchange).unwrap();
        // Server side mirrors via the responder path on its ratchet.
        server
            .ratchet
            .accept_exchange(&server.keystore, &client_exchange.to_peer_handshake(), None)
            .unwrap();
        server.peer_handshake = Some(client_exchange);

        let envelope = client
            .seal(b"ping", 9000, EnvelopeType::Request)
            .unwrap();
        assert_eq!(server.open(&envelope).unwrap(), b"ping");
        assert_eq!(server_events.processed.lock().len(), 1);

        // Persist and restore the client; the channel still works.
        let state = client.to_state().unwrap();
        let restored_events = RecordingEvents::new();
        let restored_dyn = events_handle(&restored_events);
        let mut restored = Session::from_state(&state, restored_dyn).unwrap();

        let envelope2 = restored.seal(b"after-restore", 9001, EnvelopeType::Request).unwrap();
        assert_eq!(server.open(&envelope2).unwrap(), b"after-restore");
    }
}
