//! Long-term identity material for one protocol installation.
//!
//! The keystore owns the X25519/Ed25519 identity pair, the signed prekey and
//! its signature, and a pool of one-time prekeys. It can be generated from
//! fresh entropy or derived deterministically from a master key, and it
//! round-trips through a plain state record for persistence.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore as _;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::kdf;

/// One X25519 prekey that may be consumed at most once.
struct OneTimePrekey {
    id: u32,
    secret: StaticSecret,
    public: X25519Public,
    consumed: bool,
}

/// Identity keystore: the cryptographic root of one installation.
pub struct IdentityKeystore {
    identity_signing: SigningKey,
    identity_x25519: StaticSecret,
    identity_x25519_public: X25519Public,
    signed_prekey: StaticSecret,
    signed_prekey_public: X25519Public,
    signed_prekey_signature: [u8; 64],
    one_time_prekeys: Vec<OneTimePrekey>,
}

/// Read-only public half of the keystore, handed to handshake flows.
#[derive(Debug, Clone)]
pub struct PublicBundle {
    pub identity_x25519: [u8; 32],
    pub identity_ed25519: [u8; 32],
    pub signed_prekey: [u8; 32],
    pub signed_prekey_signature: [u8; 64],
    pub one_time_prekeys: Vec<(u32, [u8; 32])>,
}

/// Serializable state record. Private scalars are raw here; sealing is the
/// storage layer's contract.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct IdentityKeysRecord {
    pub signing_seed: [u8; 32],
    pub identity_x25519_secret: [u8; 32],
    pub signed_prekey_secret: [u8; 32],
    pub signed_prekey_signature: [u8; 64],
    pub one_time_prekeys: Vec<OneTimePrekeyRecord>,
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct OneTimePrekeyRecord {
    pub id: u32,
    pub secret: [u8; 32],
    pub consumed: bool,
}

impl IdentityKeystore {
    /// Generate a fresh keystore from OS entropy.
    pub fn create(one_time_key_count: u32) -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let identity_signing = SigningKey::from_bytes(&seed);
        seed.zeroize();

        let identity_x25519 = StaticSecret::random_from_rng(OsRng);
        let signed_prekey = StaticSecret::random_from_rng(OsRng);
        Self::assemble(
            identity_signing,
            identity_x25519,
            signed_prekey,
            fresh_one_time_prekeys(0, one_time_key_count),
        )
    }

    /// Derive a keystore deterministically from a master key.
    ///
    /// Identity and signed-prekey scalars are HKDF-SHA256 expansions of
    /// `master_key || membership_id` under the fixed `ecliptix-identity-*`
    /// info strings, so the same master key always reproduces the same
    /// bundle for a given membership. One-time prekeys stay random.
    pub fn create_from_master_key(
        master_key: &[u8],
        membership_id: &[u8],
        one_time_key_count: u32,
    ) -> Result<Self, CryptoError> {
        if master_key.is_empty() {
            return Err(CryptoError::IdentityInit("empty master key".into()));
        }
        let mut ikm = Vec::with_capacity(master_key.len() + membership_id.len());
        ikm.extend_from_slice(master_key);
        ikm.extend_from_slice(membership_id);

        let mut signing_seed = kdf::derive_key32(&ikm, kdf::IDENTITY_ED25519_INFO)
            .map_err(|e| CryptoError::IdentityInit(e.to_string()))?;
        let x25519_scalar = kdf::derive_key32(&ikm, kdf::IDENTITY_X25519_INFO)
            .map_err(|e| CryptoError::IdentityInit(e.to_string()))?;
        let prekey_scalar = kdf::derive_key32(&ikm, kdf::SIGNED_PREKEY_INFO)
            .map_err(|e| CryptoError::IdentityInit(e.to_string()))?;
        ikm.zeroize();

        let identity_signing = SigningKey::from_bytes(&signing_seed);
        signing_seed.zeroize();

        Self::assemble(
            identity_signing,
            StaticSecret::from(x25519_scalar),
            StaticSecret::from(prekey_scalar),
            fresh_one_time_prekeys(0, one_time_key_count),
        )
    }

    fn assemble(
        identity_signing: SigningKey,
        identity_x25519: StaticSecret,
        signed_prekey: StaticSecret,
        one_time_prekeys: Vec<OneTimePrekey>,
    ) -> Result<Self, CryptoError> {
        let identity_x25519_public = X25519Public::from(&identity_x25519);
        let signed_prekey_public = X25519Public::from(&signed_prekey);
        let signature = identity_signing.sign(signed_prekey_public.as_bytes());

        Ok(Self {
            identity_signing,
            identity_x25519,
            identity_x25519_public,
            signed_prekey,
            signed_prekey_public,
            signed_prekey_signature: signature.to_bytes(),
            one_time_prekeys,
        })
    }

    /// Public bundle for handshake assembly. Consumed prekeys are excluded.
    pub fn public_bundle(&self) -> PublicBundle {
        PublicBundle {
            identity_x25519: *self.identity_x25519_public.as_bytes(),
            identity_ed25519: self.identity_signing.verifying_key().to_bytes(),
            signed_prekey: *self.signed_prekey_public.as_bytes(),
            signed_prekey_signature: self.signed_prekey_signature,
            one_time_prekeys: self
                .one_time_prekeys
                .iter()
                .filter(|k| !k.consumed)
                .map(|k| (k.id, *k.public.as_bytes()))
                .collect(),
        }
    }

    /// Sign arbitrary bytes with the Ed25519 identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.identity_signing.sign(message).to_bytes()
    }

    /// Verify an Ed25519 signature against a raw 32-byte public key.
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| CryptoError::InvalidKey(format!("ed25519 public key: {e}")))?;
        let sig = Signature::from_bytes(signature);
        key.verify(message, &sig)
            .map_err(|e| CryptoError::InvalidKey(format!("signature rejected: {e}")))
    }

    /// Consume one unconsumed one-time prekey, if any remain.
    ///
    /// The entry is marked consumed rather than removed so the pool's ids
    /// stay stable across persistence round-trips.
    pub fn take_one_time_prekey(&mut self) -> Option<(u32, StaticSecret)> {
        let slot = self.one_time_prekeys.iter_mut().find(|k| !k.consumed)?;
        slot.consumed = true;
        Some((slot.id, slot.secret.clone()))
    }

    /// Number of unconsumed one-time prekeys.
    pub fn available_one_time_prekeys(&self) -> usize {
        self.one_time_prekeys.iter().filter(|k| !k.consumed).count()
    }

    pub(crate) fn identity_x25519_secret(&self) -> &StaticSecret {
        &self.identity_x25519
    }

    pub(crate) fn signed_prekey_secret(&self) -> &StaticSecret {
        &self.signed_prekey
    }

    /// Snapshot the keystore into a serializable record.
    pub fn to_state(&self) -> IdentityKeysRecord {
        IdentityKeysRecord {
            signing_seed: self.identity_signing.to_bytes(),
            identity_x25519_secret: self.identity_x25519.to_bytes(),
            signed_prekey_secret: self.signed_prekey.to_bytes(),
            signed_prekey_signature: self.signed_prekey_signature,
            one_time_prekeys: self
                .one_time_prekeys
                .iter()
                .map(|k| OneTimePrekeyRecord {
                    id: k.id,
                    secret: k.secret.to_bytes(),
                    consumed: k.consumed,
                })
                .collect(),
        }
    }

    /// Rebuild a keystore from a persisted record.
    pub fn from_state(record: &IdentityKeysRecord) -> Result<Self, CryptoError> {
        let identity_signing = SigningKey::from_bytes(&record.signing_seed);
        let identity_x25519 = StaticSecret::from(record.identity_x25519_secret);
        let signed_prekey = StaticSecret::from(record.signed_prekey_secret);
        let identity_x25519_public = X25519Public::from(&identity_x25519);
        let signed_prekey_public = X25519Public::from(&signed_prekey);

        // The stored signature must still bind the stored prekey.
        Self::verify(
            &identity_signing.verifying_key().to_bytes(),
            signed_prekey_public.as_bytes(),
            &record.signed_prekey_signature,
        )
        .map_err(|_| CryptoError::IdentityInit("signed prekey signature mismatch".into()))?;

        Ok(Self {
            identity_signing,
            identity_x25519,
            identity_x25519_public,
            signed_prekey,
            signed_prekey_public,
            signed_prekey_signature: record.signed_prekey_signature,
            one_time_prekeys: record
                .one_time_prekeys
                .iter()
                .map(|r| {
                    let secret = StaticSecret::from(r.secret);
                    let public = X25519Public::from(&secret);
                    OneTimePrekey { id: r.id, secret, public, consumed: r.consumed }
                })
                .collect(),
        })
    }
}

impl std::fmt::Debug for IdentityKeystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeystore")
            .field(
                "identity_ed25519",
                &hex::encode(self.identity_signing.verifying_key().to_bytes()),
            )
            .field("one_time_prekeys", &self.one_time_prekeys.len())
            .finish()
    }
}

fn fresh_one_time_prekeys(first_id: u32, count: u32) -> Vec<OneTimePrekey> {
    (0..count)
        .map(|i| {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = X25519Public::from(&secret);
            OneTimePrekey { id: first_id + i, secret, public, consumed: false }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_key_derivation_is_stable_per_membership() {
        let master = [0x42u8; 32];
        let a = IdentityKeystore::create_from_master_key(&master, b"member-1", 0).unwrap();
        let b = IdentityKeystore::create_from_master_key(&master, b"member-1", 0).unwrap();
        let c = IdentityKeystore::create_from_master_key(&master, b"member-2", 0).unwrap();

        assert_eq!(a.public_bundle().identity_ed25519, b.public_bundle().identity_ed25519);
        assert_eq!(a.public_bundle().signed_prekey, b.public_bundle().signed_prekey);
        assert_ne!(a.public_bundle().identity_ed25519, c.public_bundle().identity_ed25519);
    }

    #[test]
    fn empty_master_key_is_rejected() {
        let err = IdentityKeystore::create_from_master_key(&[], b"m", 0);
        assert!(matches!(err, Err(CryptoError::IdentityInit(_))));
    }

    #[test]
    fn signed_prekey_signature_verifies() {
        let ks = IdentityKeystore::create(0).unwrap();
        let bundle = ks.public_bundle();
        IdentityKeystore::verify(
            &bundle.identity_ed25519,
            &bundle.signed_prekey,
            &bundle.signed_prekey_signature,
        )
        .unwrap();
    }

    #[test]
    fn one_time_prekeys_are_consumed_once() {
        let mut ks = IdentityKeystore::create(2).unwrap();
        assert_eq!(ks.available_one_time_prekeys(), 2);

        let (id0, _) = ks.take_one_time_prekey().unwrap();
        let (id1, _) = ks.take_one_time_prekey().unwrap();
        assert_ne!(id0, id1);
        assert!(ks.take_one_time_prekey().is_none());

        // Consumption survives a persistence round-trip.
        let restored = IdentityKeystore::from_state(&ks.to_state()).unwrap();
        assert_eq!(restored.available_one_time_prekeys(), 0);
    }

    #[test]
    fn state_roundtrip_preserves_bundle() {
        let ks = IdentityKeystore::create(3).unwrap();
        let restored = IdentityKeystore::from_state(&ks.to_state()).unwrap();

        let a = ks.public_bundle();
        let b = restored.public_bundle();
        assert_eq!(a.identity_ed25519, b.identity_ed25519);
        assert_eq!(a.identity_x25519, b.identity_x25519);
        assert_eq!(a.signed_prekey, b.signed_prekey);
        assert_eq!(a.one_time_prekeys, b.one_time_prekeys);
    }

    #[test]
    fn tampered_state_is_rejected() {
        let ks = IdentityKeystore::create(0).unwrap();
        let mut record = ks.to_state();
        record.signed_prekey_secret[0] ^= 0xFF;
        assert!(matches!(
            IdentityKeystore::from_state(&record),
            Err(CryptoError::IdentityInit(_))
        ));
    }
}
