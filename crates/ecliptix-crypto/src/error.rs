use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("identity initialization failed: {0}")]
    IdentityInit(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("too many skipped messages: {0}")]
    ChainOverrun(String),

    #[error("session validation failed: {0}")]
    SessionValidation(String),

    #[error("exchange state error: {0}")]
    ExchangeState(String),
}
