//! Hand-rolled binary codec for the wire and persistence model.
//!
//! Layout conventions: integers are big-endian; fixed-size keys are raw;
//! variable-length fields carry a u32 length prefix; repeated groups carry a
//! u16 count. Nested records are length-prefixed blocks so readers can skip
//! what they do not understand.

use ecliptix_crypto::{
    IdentityKeysRecord, OneTimePrekeyRecord, RatchetStateRecord, SkippedKeyRecord,
};

use crate::envelope::{
    exchange_type_from_wire, exchange_type_to_wire, AuthenticatedEstablishRequest,
    EnvelopeMetadata, EnvelopeType, PubKeyExchange, RestoreChannelResponse, RestoreStatus,
    SecureEnvelope, SessionState,
};
use crate::error::ProtoError;

// ── Writer helpers ──────────────────────────────────────────────────────────

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).expect("field length must fit in u32");
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_count(out: &mut Vec<u8>, count: usize) -> Result<(), ProtoError> {
    let count = u16::try_from(count)
        .map_err(|_| ProtoError::Encode(format!("group count {count} exceeds u16")))?;
    out.extend_from_slice(&count.to_be_bytes());
    Ok(())
}

fn put_opt_key(out: &mut Vec<u8>, key: Option<[u8; 32]>) {
    match key {
        Some(k) => {
            out.push(1);
            out.extend_from_slice(&k);
        }
        None => out.push(0),
    }
}

// ── Reader ──────────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| ProtoError::Decode(format!("truncated at offset {}", self.pos)))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtoError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtoError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ProtoError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, ProtoError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn key32(&mut self) -> Result<[u8; 32], ProtoError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.take(32)?);
        Ok(out)
    }

    fn sig64(&mut self) -> Result<[u8; 64], ProtoError> {
        let mut out = [0u8; 64];
        out.copy_from_slice(self.take(64)?);
        Ok(out)
    }

    fn bool(&mut self) -> Result<bool, ProtoError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtoError::Decode(format!("invalid bool byte {other}"))),
        }
    }

    fn opt_key(&mut self) -> Result<Option<[u8; 32]>, ProtoError> {
        if self.bool()? {
            Ok(Some(self.key32()?))
        } else {
            Ok(None)
        }
    }

    fn finish(&self) -> Result<(), ProtoError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(ProtoError::Decode(format!(
                "{} trailing bytes after record",
                self.data.len() - self.pos
            )))
        }
    }
}

// ── Envelope ────────────────────────────────────────────────────────────────

pub fn encode_metadata(metadata: &EnvelopeMetadata) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&metadata.request_id.to_be_bytes());
    out.push(metadata.envelope_type as u8);
    out.extend_from_slice(&metadata.ratchet_index.to_be_bytes());
    put_bytes(&mut out, &metadata.nonce);
    put_bytes(&mut out, &metadata.ratchet_dh_public);
    out
}

fn read_metadata(r: &mut Reader<'_>) -> Result<EnvelopeMetadata, ProtoError> {
    let request_id = r.u32()?;
    let envelope_type = EnvelopeType::try_from(r.u8()?)?;
    let ratchet_index = r.u32()?;
    let nonce = r.bytes()?;
    let ratchet_dh_public = r.bytes()?;
    Ok(EnvelopeMetadata { request_id, nonce, ratchet_index, envelope_type, ratchet_dh_public })
}

pub fn decode_metadata(data: &[u8]) -> Result<EnvelopeMetadata, ProtoError> {
    let mut r = Reader::new(data);
    let metadata = read_metadata(&mut r)?;
    r.finish()?;
    Ok(metadata)
}

pub fn encode_envelope(envelope: &SecureEnvelope) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        64 + envelope.encrypted_payload.len() + envelope.authentication_tag.len(),
    );
    put_bytes(&mut out, &encode_metadata(&envelope.metadata));
    put_bytes(&mut out, &envelope.encrypted_payload);
    put_bytes(&mut out, &envelope.authentication_tag);
    out
}

pub fn decode_envelope(data: &[u8]) -> Result<SecureEnvelope, ProtoError> {
    let mut r = Reader::new(data);
    let metadata = decode_metadata(&r.bytes()?)?;
    let encrypted_payload = r.bytes()?;
    let authentication_tag = r.bytes()?;
    r.finish()?;
    Ok(SecureEnvelope { metadata, encrypted_payload, authentication_tag })
}

// ── Handshake ───────────────────────────────────────────────────────────────

pub fn encode_pub_key_exchange(exchange: &PubKeyExchange) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.push(exchange_type_to_wire(exchange.exchange_type));
    out.extend_from_slice(&exchange.identity_x25519_pub);
    out.extend_from_slice(&exchange.identity_ed25519_pub);
    out.extend_from_slice(&exchange.signed_prekey_pub);
    out.extend_from_slice(&exchange.signed_prekey_sig);
    out.extend_from_slice(&exchange.initial_dh_pub);
    put_count(&mut out, exchange.one_time_prekey_pubs.len())
        .expect("one-time prekey pool is bounded");
    for opk in &exchange.one_time_prekey_pubs {
        out.extend_from_slice(opk);
    }
    out
}

fn read_pub_key_exchange(r: &mut Reader<'_>) -> Result<PubKeyExchange, ProtoError> {
    let exchange_type = exchange_type_from_wire(r.u8()?)?;
    let identity_x25519_pub = r.key32()?;
    let identity_ed25519_pub = r.key32()?;
    let signed_prekey_pub = r.key32()?;
    let signed_prekey_sig = r.sig64()?;
    let initial_dh_pub = r.key32()?;
    let count = r.u16()?;
    let mut one_time_prekey_pubs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        one_time_prekey_pubs.push(r.key32()?);
    }
    Ok(PubKeyExchange {
        identity_x25519_pub,
        identity_ed25519_pub,
        signed_prekey_pub,
        signed_prekey_sig,
        one_time_prekey_pubs,
        initial_dh_pub,
        exchange_type,
    })
}

pub fn decode_pub_key_exchange(data: &[u8]) -> Result<PubKeyExchange, ProtoError> {
    let mut r = Reader::new(data);
    let exchange = read_pub_key_exchange(&mut r)?;
    r.finish()?;
    Ok(exchange)
}

pub fn encode_authenticated_establish_request(
    request: &AuthenticatedEstablishRequest,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(300);
    put_bytes(&mut out, &request.membership_unique_id);
    put_bytes(&mut out, &encode_pub_key_exchange(&request.client_pub_key_exchange));
    out
}

pub fn decode_authenticated_establish_request(
    data: &[u8],
) -> Result<AuthenticatedEstablishRequest, ProtoError> {
    let mut r = Reader::new(data);
    let membership_unique_id = r.bytes()?;
    let client_pub_key_exchange = decode_pub_key_exchange(&r.bytes()?)?;
    r.finish()?;
    Ok(AuthenticatedEstablishRequest { membership_unique_id, client_pub_key_exchange })
}

// ── Restore ─────────────────────────────────────────────────────────────────

pub fn encode_restore_response(response: &RestoreChannelResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.push(response.status as u8);
    out.extend_from_slice(&response.sending_chain_length.to_be_bytes());
    out.extend_from_slice(&response.receiving_chain_length.to_be_bytes());
    out
}

pub fn decode_restore_response(data: &[u8]) -> Result<RestoreChannelResponse, ProtoError> {
    let mut r = Reader::new(data);
    let status = RestoreStatus::try_from(r.u8()?)?;
    let sending_chain_length = r.u32()?;
    let receiving_chain_length = r.u32()?;
    r.finish()?;
    Ok(RestoreChannelResponse { status, sending_chain_length, receiving_chain_length })
}

// ── Persisted session state ─────────────────────────────────────────────────

fn encode_identity_keys(record: &IdentityKeysRecord) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&record.signing_seed);
    out.extend_from_slice(&record.identity_x25519_secret);
    out.extend_from_slice(&record.signed_prekey_secret);
    out.extend_from_slice(&record.signed_prekey_signature);
    put_count(&mut out, record.one_time_prekeys.len())?;
    for opk in &record.one_time_prekeys {
        out.extend_from_slice(&opk.id.to_be_bytes());
        out.extend_from_slice(&opk.secret);
        out.push(u8::from(opk.consumed));
    }
    Ok(out)
}

fn decode_identity_keys(data: &[u8]) -> Result<IdentityKeysRecord, ProtoError> {
    let mut r = Reader::new(data);
    let signing_seed = r.key32()?;
    let identity_x25519_secret = r.key32()?;
    let signed_prekey_secret = r.key32()?;
    let signed_prekey_signature = r.sig64()?;
    let count = r.u16()?;
    let mut one_time_prekeys = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = r.u32()?;
        let secret = r.key32()?;
        let consumed = r.bool()?;
        one_time_prekeys.push(OneTimePrekeyRecord { id, secret, consumed });
    }
    r.finish()?;
    Ok(IdentityKeysRecord {
        signing_seed,
        identity_x25519_secret,
        signed_prekey_secret,
        signed_prekey_signature,
        one_time_prekeys,
    })
}

fn encode_ratchet_state(record: &RatchetStateRecord) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&record.root_key);
    out.extend_from_slice(&record.sending_chain_key);
    out.extend_from_slice(&record.sending_index.to_be_bytes());
    out.extend_from_slice(&record.sending_dh_secret);
    out.push(u8::from(record.sending_seeded));
    out.extend_from_slice(&record.receiving_chain_key);
    out.extend_from_slice(&record.receiving_index.to_be_bytes());
    put_opt_key(&mut out, record.remote_dh);
    out.push(u8::from(record.receiving_seeded));
    out.extend_from_slice(&record.prev_sending_len.to_be_bytes());
    put_opt_key(&mut out, record.previous_remote_dh);
    put_count(&mut out, record.skipped.len())?;
    for entry in &record.skipped {
        out.extend_from_slice(&entry.dh_public);
        out.extend_from_slice(&entry.index.to_be_bytes());
        out.extend_from_slice(&entry.message_key);
    }
    out.push(u8::from(record.established));
    Ok(out)
}

fn decode_ratchet_state(data: &[u8]) -> Result<RatchetStateRecord, ProtoError> {
    let mut r = Reader::new(data);
    let root_key = r.key32()?;
    let sending_chain_key = r.key32()?;
    let sending_index = r.u32()?;
    let sending_dh_secret = r.key32()?;
    let sending_seeded = r.bool()?;
    let receiving_chain_key = r.key32()?;
    let receiving_index = r.u32()?;
    let remote_dh = r.opt_key()?;
    let receiving_seeded = r.bool()?;
    let prev_sending_len = r.u32()?;
    let previous_remote_dh = r.opt_key()?;
    let count = r.u16()?;
    let mut skipped = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let dh_public = r.key32()?;
        let index = r.u32()?;
        let message_key = r.key32()?;
        skipped.push(SkippedKeyRecord { dh_public, index, message_key });
    }
    let established = r.bool()?;
    r.finish()?;
    Ok(RatchetStateRecord {
        root_key,
        sending_chain_key,
        sending_index,
        sending_dh_secret,
        sending_seeded,
        receiving_chain_key,
        receiving_index,
        remote_dh,
        receiving_seeded,
        prev_sending_len,
        previous_remote_dh,
        skipped,
        established,
    })
}

pub fn encode_session_state(state: &SessionState) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(1024);
    out.extend_from_slice(&state.connect_id.to_be_bytes());
    put_bytes(&mut out, &encode_identity_keys(&state.identity_keys)?);
    put_bytes(&mut out, &encode_pub_key_exchange(&state.peer_handshake));
    put_bytes(&mut out, &encode_ratchet_state(&state.ratchet_state)?);
    Ok(out)
}

pub fn decode_session_state(data: &[u8]) -> Result<SessionState, ProtoError> {
    let mut r = Reader::new(data);
    let connect_id = r.u32()?;
    let identity_keys = decode_identity_keys(&r.bytes()?)?;
    let peer_handshake = decode_pub_key_exchange(&r.bytes()?)?;
    let ratchet_state = decode_ratchet_state(&r.bytes()?)?;
    r.finish()?;
    Ok(SessionState { connect_id, identity_keys, peer_handshake, ratchet_state })
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// Encode a wall-clock value for the `{connect_id}_timestamp` sibling key.
pub fn encode_timestamp(unix_millis: u64) -> [u8; 8] {
    unix_millis.to_be_bytes()
}

pub fn decode_timestamp(data: &[u8]) -> Result<u64, ProtoError> {
    let mut r = Reader::new(data);
    let value = r.u64()?;
    r.finish()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecliptix_crypto::ExchangeType;

    fn sample_exchange() -> PubKeyExchange {
        PubKeyExchange {
            identity_x25519_pub: [1u8; 32],
            identity_ed25519_pub: [2u8; 32],
            signed_prekey_pub: [3u8; 32],
            signed_prekey_sig: [4u8; 64],
            one_time_prekey_pubs: vec![[5u8; 32], [6u8; 32]],
            initial_dh_pub: [7u8; 32],
            exchange_type: ExchangeType::EphemeralConnect,
        }
    }

    #[test]
    fn envelope_roundtrip() {
        let envelope = SecureEnvelope {
            metadata: EnvelopeMetadata {
                request_id: 0xDEAD_BEEF,
                nonce: vec![9u8; 12],
                ratchet_index: 17,
                envelope_type: EnvelopeType::Request,
                ratchet_dh_public: vec![8u8; 32],
            },
            encrypted_payload: b"ciphertext".to_vec(),
            authentication_tag: vec![0xAA; 16],
        };
        let decoded = decode_envelope(&encode_envelope(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let envelope = SecureEnvelope {
            metadata: EnvelopeMetadata {
                request_id: 1,
                nonce: vec![0u8; 12],
                ratchet_index: 0,
                envelope_type: EnvelopeType::Response,
                ratchet_dh_public: vec![1u8; 32],
            },
            encrypted_payload: vec![1, 2, 3],
            authentication_tag: vec![4u8; 16],
        };
        let mut bytes = encode_envelope(&envelope);
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(decode_envelope(&bytes), Err(ProtoError::Decode(_))));
    }

    #[test]
    fn invalid_envelope_type_is_rejected() {
        let mut bytes = encode_metadata(&EnvelopeMetadata {
            request_id: 1,
            nonce: vec![],
            ratchet_index: 0,
            envelope_type: EnvelopeType::Request,
            ratchet_dh_public: vec![],
        });
        bytes[4] = 9; // envelope_type discriminant
        assert!(matches!(
            decode_metadata(&bytes),
            Err(ProtoError::UnknownEnvelopeType(9))
        ));
    }

    #[test]
    fn authenticated_request_roundtrip() {
        let request = AuthenticatedEstablishRequest {
            membership_unique_id: vec![0xAB; 16],
            client_pub_key_exchange: sample_exchange(),
        };
        let decoded =
            decode_authenticated_establish_request(&encode_authenticated_establish_request(&request))
                .unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn restore_response_roundtrip() {
        let response = RestoreChannelResponse {
            status: RestoreStatus::SessionNotFound,
            sending_chain_length: 12,
            receiving_chain_length: 40,
        };
        assert_eq!(
            decode_restore_response(&encode_restore_response(&response)).unwrap(),
            response
        );
    }

    #[test]
    fn session_state_roundtrip_preserves_ratchet_and_identity() {
        use ecliptix_crypto::{IdentityKeystore, RatchetConnection};

        let mut keystore = IdentityKeystore::create(2).unwrap();
        keystore.take_one_time_prekey().unwrap();
        let connection = RatchetConnection::new(42, ExchangeType::EphemeralConnect);

        let state = SessionState {
            connect_id: 42,
            identity_keys: keystore.to_state(),
            peer_handshake: sample_exchange(),
            ratchet_state: connection.to_state(),
        };
        let decoded = decode_session_state(&encode_session_state(&state).unwrap()).unwrap();

        assert_eq!(decoded.connect_id, 42);
        assert_eq!(decoded.ratchet_state, state.ratchet_state);
        assert_eq!(decoded.peer_handshake, state.peer_handshake);
        assert_eq!(decoded.identity_keys.one_time_prekeys.len(), 2);
        assert!(decoded.identity_keys.one_time_prekeys[0].consumed);

        // The decoded identity still reconstructs a working keystore.
        IdentityKeystore::from_state(&decoded.identity_keys).unwrap();
    }

    #[test]
    fn timestamp_roundtrip() {
        let encoded = encode_timestamp(1_722_470_400_123);
        assert_eq!(encoded.len(), 8);
        assert_eq!(decode_timestamp(&encoded).unwrap(), 1_722_470_400_123);
    }
}
