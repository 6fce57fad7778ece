//! Key derivation for the Ecliptix protocol.
//!
//! All root-level derivations are HKDF-SHA256 with fixed ASCII info strings;
//! chain advancement is HMAC-SHA256 with single-byte domain constants.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Info string for the protocol root key (master-key and handshake paths).
pub const ROOT_KEY_INFO: &[u8] = b"ecliptix-protocol-root-key";
/// Info string for the deterministic X25519 identity scalar.
pub const IDENTITY_X25519_INFO: &[u8] = b"ecliptix-identity-x25519";
/// Info string for the deterministic Ed25519 identity seed.
pub const IDENTITY_ED25519_INFO: &[u8] = b"ecliptix-identity-ed25519";
/// Info string for the deterministic signed-prekey scalar.
pub const SIGNED_PREKEY_INFO: &[u8] = b"ecliptix-signed-prekey";

/// Info string for root advancement during a DH ratchet step.
const RATCHET_ROOT_INFO: &[u8] = b"ecliptix-ratchet-root";
/// Info string for the chain key seeded by a DH ratchet step.
const RATCHET_CHAIN_INFO: &[u8] = b"ecliptix-ratchet-chain";

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be `None` (HKDF substitutes a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive a 32-byte secret from input key material with no salt.
pub fn derive_key32(ikm: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut out = [0u8; 32];
    hkdf_expand(ikm, None, info, &mut out)?;
    Ok(out)
}

/// Derive the initial protocol root key from a long-lived master key.
pub fn root_key_from_master(master_key: &[u8]) -> Result<[u8; 32], CryptoError> {
    derive_key32(master_key, ROOT_KEY_INFO)
}

/// Advance the root key with a DH ratchet output.
///
/// The previous root is the HKDF salt, so each chain's derivation is bound
/// to the full ratchet history. Returns (new_root_key, new_chain_key).
pub fn advance_root(
    root_key: &[u8; 32],
    dh_output: &[u8],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_output);
    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    hk.expand(RATCHET_ROOT_INFO, &mut new_root)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(RATCHET_CHAIN_INFO, &mut chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_root, chain_key))
}

/// Advance a chain key one message step.
///
/// The message key is HMAC-SHA256(chain_key, 0x01); the successor chain key
/// is HMAC-SHA256(chain_key, 0x02). Returns (next_chain_key, message_key).
pub fn chain_step(chain_key: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut mk_mac = HmacSha256::new_from_slice(chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mk_mac.update(&[0x01]);
    let message_key: [u8; 32] = mk_mac.finalize().into_bytes().into();

    let mut ck_mac = HmacSha256::new_from_slice(chain_key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    ck_mac.update(&[0x02]);
    let next_chain_key: [u8; 32] = ck_mac.finalize().into_bytes().into();

    Ok((next_chain_key, message_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_root_derivation_is_deterministic() {
        let master = [7u8; 32];
        let a = root_key_from_master(&master).unwrap();
        let b = root_key_from_master(&master).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, [0u8; 32]);
    }

    #[test]
    fn advance_root_changes_both_outputs() {
        let root = [1u8; 32];
        let (r1, c1) = advance_root(&root, &[2u8; 32]).unwrap();
        assert_ne!(r1, root);
        assert_ne!(r1, c1);

        // Different DH output, different keys.
        let (r2, c2) = advance_root(&root, &[3u8; 32]).unwrap();
        assert_ne!(r1, r2);
        assert_ne!(c1, c2);
    }

    #[test]
    fn chain_step_separates_message_and_chain_keys() {
        let ck = [9u8; 32];
        let (next, mk) = chain_step(&ck).unwrap();
        assert_ne!(next, mk);
        assert_ne!(next, ck);

        // Stepping again from the successor diverges further.
        let (next2, mk2) = chain_step(&next).unwrap();
        assert_ne!(next2, next);
        assert_ne!(mk2, mk);
    }
}
