//! RSA-chunked bootstrap envelope.
//!
//! The first handshake travels before any ratchet exists, so its payload is
//! RSA-OAEP(SHA-256) encrypted under the pinned server key. RSA caps the
//! plaintext per block, so the payload is split into fixed-size chunks and
//! each encrypted block is framed as `len_u16_be || rsa_block`.

use rsa::traits::PublicKeyParts as _;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::ProtoError;

/// OAEP-SHA256 overhead per RSA block: 2 * hash_len + 2.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

/// Largest plaintext chunk a single RSA block can carry under this key.
pub fn max_chunk_len(key: &RsaPublicKey) -> Result<usize, ProtoError> {
    let modulus = key.size();
    if modulus <= OAEP_OVERHEAD {
        return Err(ProtoError::RsaEncryption(format!(
            "key modulus {modulus} too small for OAEP"
        )));
    }
    Ok(modulus - OAEP_OVERHEAD)
}

/// Chunk-encrypt `plaintext` under the pinned server key.
pub fn encrypt_chunked(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let chunk_len = max_chunk_len(key)?;
    let mut rng = rand::rngs::OsRng;
    let mut out = Vec::with_capacity(plaintext.len() + key.size());

    for chunk in plaintext.chunks(chunk_len.max(1)) {
        let block = key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)
            .map_err(|e| ProtoError::RsaEncryption(format!("chunk encrypt: {e}")))?;
        let len = u16::try_from(block.len())
            .map_err(|_| ProtoError::RsaEncryption("rsa block exceeds u16 frame".into()))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&block);
    }

    tracing::trace!(
        payload_len = plaintext.len(),
        framed_len = out.len(),
        "bootstrap payload chunk-encrypted"
    );
    Ok(out)
}

/// Reverse of [`encrypt_chunked`]: walk the frames and decrypt each block.
pub fn decrypt_chunked(key: &RsaPrivateKey, payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(payload.len());
    let mut pos = 0usize;

    while pos < payload.len() {
        if pos + 2 > payload.len() {
            return Err(ProtoError::RsaEncryption("truncated chunk frame".into()));
        }
        let len = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
        pos += 2;
        if len == 0 || pos + len > payload.len() {
            return Err(ProtoError::RsaEncryption(format!(
                "invalid chunk length {len} at offset {pos}"
            )));
        }
        let block = &payload[pos..pos + len];
        pos += len;

        let chunk = key
            .decrypt(Oaep::new::<Sha256>(), block)
            .map_err(|e| ProtoError::RsaEncryption(format!("chunk decrypt: {e}")))?;
        out.extend_from_slice(&chunk);
    }

    Ok(out)
}
