use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("unknown envelope type: {0}")]
    UnknownEnvelopeType(u8),

    #[error("unknown exchange type: {0}")]
    UnknownExchangeType(u8),

    #[error("unknown restore status: {0}")]
    UnknownRestoreStatus(u8),

    #[error("rsa bootstrap failed: {0}")]
    RsaEncryption(String),
}

impl From<ecliptix_crypto::CryptoError> for ProtoError {
    fn from(e: ecliptix_crypto::CryptoError) -> Self {
        Self::Decode(e.to_string())
    }
}
