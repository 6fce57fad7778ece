//! Bootstrap envelope construction and verification.
//!
//! The anonymous establishment flow: the client's `PubKeyExchange` is
//! RSA-chunk-encrypted under the pinned server key and wrapped in a request
//! envelope; the server's reply is pin-verified, decrypted with the client's
//! provisioned key, and parsed back into the peer's exchange.

use ecliptix_crypto::kdf;
use ecliptix_proto::codec;
use ecliptix_proto::{bootstrap, EnvelopeMetadata, EnvelopeType, PubKeyExchange, SecureEnvelope};

use crate::failure::NetworkFailure;
use crate::pinning::CertificatePinning;

/// Wrap a local exchange into the RSA-chunked bootstrap request.
pub(crate) fn build_bootstrap_request(
    pinning: &dyn CertificatePinning,
    exchange: &PubKeyExchange,
    request_id: u32,
) -> Result<SecureEnvelope, NetworkFailure> {
    let encoded = codec::encode_pub_key_exchange(exchange);
    let framed = bootstrap::encrypt_chunked(pinning.server_encryption_key(), &encoded)?;
    Ok(SecureEnvelope {
        metadata: EnvelopeMetadata {
            request_id,
            nonce: Vec::new(),
            ratchet_index: 0,
            envelope_type: EnvelopeType::Request,
            ratchet_dh_public: Vec::new(),
        },
        encrypted_payload: framed,
        authentication_tag: Vec::new(),
    })
}

/// Verify and open the server's bootstrap response.
pub(crate) fn parse_bootstrap_response(
    pinning: &dyn CertificatePinning,
    envelope: &SecureEnvelope,
) -> Result<PubKeyExchange, NetworkFailure> {
    if !pinning.verify_server_signature(&envelope.encrypted_payload, &envelope.authentication_tag)
    {
        return Err(NetworkFailure::rsa("server signature failed pin verification"));
    }
    let plain = bootstrap::decrypt_chunked(
        pinning.client_decryption_key(),
        &envelope.encrypted_payload,
    )?;
    Ok(codec::decode_pub_key_exchange(&plain)?)
}

/// Derive the initial root key for the master-key-authenticated path.
pub(crate) fn derive_authenticated_root(master_key: &[u8]) -> Result<[u8; 32], NetworkFailure> {
    kdf::root_key_from_master(master_key)
        .map_err(|e| NetworkFailure::critical_auth(format!("root key derivation: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    use ecliptix_crypto::{ExchangeType, IdentityKeystore};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    struct TestPinning {
        server_public: RsaPublicKey,
        client_private: RsaPrivateKey,
        verify_result: bool,
    }

    impl CertificatePinning for TestPinning {
        fn server_encryption_key(&self) -> &RsaPublicKey {
            &self.server_public
        }

        fn client_decryption_key(&self) -> &RsaPrivateKey {
            &self.client_private
        }

        fn verify_server_signature(&self, _payload: &[u8], _signature: &[u8]) -> bool {
            self.verify_result
        }
    }

    fn rsa_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("test key generation")
        })
    }

    fn pinning(verify_result: bool) -> TestPinning {
        let key = rsa_key().clone();
        TestPinning {
            server_public: RsaPublicKey::from(&key),
            client_private: key,
            verify_result,
        }
    }

    fn sample_exchange() -> PubKeyExchange {
        let keystore = IdentityKeystore::create(1).unwrap();
        let bundle = keystore.public_bundle();
        PubKeyExchange {
            identity_x25519_pub: bundle.identity_x25519,
            identity_ed25519_pub: bundle.identity_ed25519,
            signed_prekey_pub: bundle.signed_prekey,
            signed_prekey_sig: bundle.signed_prekey_signature,
            one_time_prekey_pubs: bundle.one_time_prekeys.iter().map(|(_, k)| *k).collect(),
            initial_dh_pub: [7u8; 32],
            exchange_type: ExchangeType::EphemeralConnect,
        }
    }

    #[test]
    fn bootstrap_roundtrip_through_rsa_chunks() {
        let pin = pinning(true);
        let exchange = sample_exchange();

        // The "server" here decrypts with the same keypair; the test pinning
        // uses one RSA key for both directions.
        let request = build_bootstrap_request(&pin, &exchange, 1234).unwrap();
        assert_eq!(request.metadata.request_id, 1234);
        assert_eq!(request.metadata.envelope_type, EnvelopeType::Request);

        let response = SecureEnvelope {
            metadata: EnvelopeMetadata {
                request_id: 1234,
                nonce: Vec::new(),
                ratchet_index: 0,
                envelope_type: EnvelopeType::Response,
                ratchet_dh_public: Vec::new(),
            },
            encrypted_payload: request.encrypted_payload.clone(),
            authentication_tag: b"sig".to_vec(),
        };
        let parsed = parse_bootstrap_response(&pin, &response).unwrap();
        assert_eq!(parsed, exchange);
    }

    #[test]
    fn pin_mismatch_is_rsa_failure() {
        let pin = pinning(false);
        let envelope = SecureEnvelope {
            metadata: EnvelopeMetadata {
                request_id: 1,
                nonce: Vec::new(),
                ratchet_index: 0,
                envelope_type: EnvelopeType::Response,
                ratchet_dh_public: Vec::new(),
            },
            encrypted_payload: vec![1, 2, 3],
            authentication_tag: vec![4, 5],
        };
        let err = parse_bootstrap_response(&pin, &envelope).unwrap_err();
        assert_eq!(err.kind, crate::failure::NetworkFailureKind::RsaEncryption);
    }

    #[test]
    fn authenticated_root_matches_kdf() {
        let master = [0xAA; 32];
        let root = derive_authenticated_root(&master).unwrap();
        assert_eq!(root, kdf::root_key_from_master(&master).unwrap());
    }
}
