pub mod bootstrap;
pub mod codec;
pub mod envelope;
pub mod error;

pub use envelope::{
    build_envelope, build_metadata, AuthenticatedEstablishRequest, EnvelopeMetadata,
    EnvelopeType, PubKeyExchange, RestoreChannelResponse, RestoreStatus, SecureEnvelope,
    SessionState,
};
pub use error::ProtoError;
