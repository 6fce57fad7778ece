//! Wire model for the secure channel.
//!
//! These structs are the byte-exact protocol surface; `codec` owns their
//! binary form. Session-facing crypto views live in `ecliptix-crypto` and
//! are bridged here where the two overlap.

use ecliptix_crypto::{ExchangeType, IdentityKeysRecord, PeerHandshake, RatchetStateRecord};

use crate::error::ProtoError;

/// Direction marker carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeType {
    Request = 1,
    Response = 2,
}

impl TryFrom<u8> for EnvelopeType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            other => Err(ProtoError::UnknownEnvelopeType(other)),
        }
    }
}

/// Plaintext header accompanying each AEAD payload.
///
/// `ratchet_dh_public` is the sender's current ratchet key so the receiver
/// can detect DH ratchet boundaries; `ratchet_index` is the message's
/// position in that sending chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeMetadata {
    pub request_id: u32,
    pub nonce: Vec<u8>,
    pub ratchet_index: u32,
    pub envelope_type: EnvelopeType,
    pub ratchet_dh_public: Vec<u8>,
}

/// One sealed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureEnvelope {
    pub metadata: EnvelopeMetadata,
    pub encrypted_payload: Vec<u8>,
    pub authentication_tag: Vec<u8>,
}

/// Build an envelope from its parts.
pub fn build_envelope(
    metadata: EnvelopeMetadata,
    encrypted_payload: Vec<u8>,
    authentication_tag: Vec<u8>,
) -> SecureEnvelope {
    SecureEnvelope { metadata, encrypted_payload, authentication_tag }
}

/// Build envelope metadata from its parts.
pub fn build_metadata(
    request_id: u32,
    nonce: Vec<u8>,
    ratchet_index: u32,
    envelope_type: EnvelopeType,
    ratchet_dh_public: Vec<u8>,
) -> EnvelopeMetadata {
    EnvelopeMetadata { request_id, nonce, ratchet_index, envelope_type, ratchet_dh_public }
}

/// Public handshake bundle exchanged during channel establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubKeyExchange {
    pub identity_x25519_pub: [u8; 32],
    pub identity_ed25519_pub: [u8; 32],
    pub signed_prekey_pub: [u8; 32],
    pub signed_prekey_sig: [u8; 64],
    pub one_time_prekey_pubs: Vec<[u8; 32]>,
    pub initial_dh_pub: [u8; 32],
    pub exchange_type: ExchangeType,
}

impl PubKeyExchange {
    /// Bridge to the crypto layer's view of the peer. The first advertised
    /// one-time prekey (if any) is the one the exchange consumes.
    pub fn to_peer_handshake(&self) -> PeerHandshake {
        PeerHandshake {
            identity_x25519: self.identity_x25519_pub,
            identity_ed25519: self.identity_ed25519_pub,
            signed_prekey: self.signed_prekey_pub,
            signed_prekey_signature: self.signed_prekey_sig,
            one_time_prekey: self.one_time_prekey_pubs.first().copied(),
            initial_dh: self.initial_dh_pub,
        }
    }
}

/// Master-key-authenticated establishment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedEstablishRequest {
    pub membership_unique_id: Vec<u8>,
    pub client_pub_key_exchange: PubKeyExchange,
}

/// Server verdict on a restore attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RestoreStatus {
    SessionRestored = 1,
    SessionNotFound = 2,
}

impl TryFrom<u8> for RestoreStatus {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        match value {
            1 => Ok(Self::SessionRestored),
            2 => Ok(Self::SessionNotFound),
            other => Err(ProtoError::UnknownRestoreStatus(other)),
        }
    }
}

/// Restore response: the server's chain lengths let the client reconcile
/// counters after loading persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreChannelResponse {
    pub status: RestoreStatus,
    pub sending_chain_length: u32,
    pub receiving_chain_length: u32,
}

/// Persisted session record, stored under `connect_id` scoped by membership.
pub struct SessionState {
    pub connect_id: u32,
    pub identity_keys: IdentityKeysRecord,
    pub peer_handshake: PubKeyExchange,
    pub ratchet_state: RatchetStateRecord,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("SessionState")
            .field("connect_id", &self.connect_id)
            .field("exchange_type", &self.peer_handshake.exchange_type)
            .field("sending_index", &self.ratchet_state.sending_index)
            .field("receiving_index", &self.ratchet_state.receiving_index)
            .field("skipped_keys", &self.ratchet_state.skipped.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn exchange_type_to_wire(exchange_type: ExchangeType) -> u8 {
    match exchange_type {
        ExchangeType::EphemeralConnect => 1,
        ExchangeType::ServerStreaming => 2,
    }
}

pub(crate) fn exchange_type_from_wire(value: u8) -> Result<ExchangeType, ProtoError> {
    match value {
        1 => Ok(ExchangeType::EphemeralConnect),
        2 => Ok(ExchangeType::ServerStreaming),
        other => Err(ProtoError::UnknownExchangeType(other)),
    }
}
