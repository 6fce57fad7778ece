//! Certificate pinning seam for the bootstrap envelope.

use rsa::{RsaPrivateKey, RsaPublicKey};

/// Pinned key material and server signature verification.
///
/// The server public key encrypts outgoing bootstrap chunks and anchors
/// `verify_server_signature`; the client private key opens the server's
/// chunked response. Both are provisioned out-of-band and never change at
/// runtime.
pub trait CertificatePinning: Send + Sync {
    /// The pinned server RSA public key.
    fn server_encryption_key(&self) -> &RsaPublicKey;

    /// The client's provisioned RSA private key for bootstrap responses.
    fn client_decryption_key(&self) -> &RsaPrivateKey;

    /// Verify the server's signature over a bootstrap payload.
    fn verify_server_signature(&self, payload: &[u8], signature: &[u8]) -> bool;
}
