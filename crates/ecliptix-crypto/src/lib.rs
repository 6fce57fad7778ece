pub mod error;
pub mod identity;
pub mod kdf;
pub mod ratchet;

pub use error::CryptoError;
pub use identity::{IdentityKeysRecord, IdentityKeystore, OneTimePrekeyRecord, PublicBundle};
pub use ratchet::{
    ExchangeType, InboundResult, OutboundResult, PeerHandshake, RatchetConnection,
    RatchetMessage, RatchetPolicy, RatchetStateRecord, SkippedKeyRecord,
};
