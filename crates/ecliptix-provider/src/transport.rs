//! Transport seam: the opaque RPC capability the provider drives.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use ecliptix_proto::{AuthenticatedEstablishRequest, RestoreChannelResponse, SecureEnvelope};

use crate::failure::NetworkFailure;

/// Logical service routed over the transport. Selects the retry policy and
/// the request-key derivation for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    EstablishChannel,
    EstablishAuthenticatedChannel,
    RestoreChannel,
    SignInComplete,
    SignUpComplete,
    VerificationStream,
    DataRead,
    DataWrite,
    Ping,
}

impl ServiceType {
    /// Auth-completion unaries get re-entry deduplication and reinit-on-fail.
    pub fn is_auth_complete(self) -> bool {
        matches!(self, Self::SignInComplete | Self::SignUpComplete)
    }

    pub fn is_stream(self) -> bool {
        matches!(self, Self::VerificationStream)
    }

    pub(crate) fn wire_name(self) -> &'static str {
        match self {
            Self::EstablishChannel => "establish",
            Self::EstablishAuthenticatedChannel => "establish-authenticated",
            Self::RestoreChannel => "restore",
            Self::SignInComplete => "signin",
            Self::SignUpComplete => "signup",
            Self::VerificationStream => "verification-stream",
            Self::DataRead => "data-read",
            Self::DataWrite => "data-write",
            Self::Ping => "ping",
        }
    }
}

/// Per-attempt request context. The idempotency key stays stable across
/// retries of one logical call; only `attempt` increments, and the server
/// deduplicates on the pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequestContext {
    pub idempotency_key: String,
    pub attempt: u32,
}

impl RpcRequestContext {
    pub fn new(idempotency_key: impl Into<String>, attempt: u32) -> Self {
        Self { idempotency_key: idempotency_key.into(), attempt }
    }
}

/// Transport-level failure, mapped onto the provider taxonomy at the seam.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport timeout: {0}")]
    Timeout(String),

    #[error("data center unreachable: {0}")]
    Unreachable(String),

    #[error("server shutting down: {0}")]
    ServerShutdown(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("stream failed: {0}")]
    Stream(String),
}

impl From<TransportError> for NetworkFailure {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(msg) | TransportError::Unreachable(msg) => {
                NetworkFailure::not_responding(msg)
            }
            TransportError::ServerShutdown(msg) => NetworkFailure::server_shutdown(msg),
            TransportError::AuthRejected(msg) => NetworkFailure::critical_auth(msg),
            TransportError::Stream(msg) => NetworkFailure::not_responding(msg),
        }
    }
}

/// Inbound envelope stream for server-streaming calls.
pub type EnvelopeStream = BoxStream<'static, Result<SecureEnvelope, TransportError>>;

/// Bidirectional RPC capability. Unary, server-streaming, and the three
/// channel-lifecycle calls; wire framing is the implementor's concern.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Anonymous bootstrap: RSA-chunked `PubKeyExchange` under the pinned key.
    async fn establish_channel(
        &self,
        request: SecureEnvelope,
    ) -> Result<SecureEnvelope, TransportError>;

    /// Master-key-authenticated establishment.
    async fn establish_authenticated_channel(
        &self,
        request: AuthenticatedEstablishRequest,
    ) -> Result<SecureEnvelope, TransportError>;

    /// Ask the server to restore the session for `connect_id`.
    async fn restore_channel(
        &self,
        connect_id: u32,
    ) -> Result<RestoreChannelResponse, TransportError>;

    /// One ratcheted request, one ratcheted response.
    async fn unary(
        &self,
        service: ServiceType,
        request: SecureEnvelope,
        context: RpcRequestContext,
    ) -> Result<SecureEnvelope, TransportError>;

    /// One ratcheted request, a stream of ratcheted responses.
    async fn receive_stream(
        &self,
        service: ServiceType,
        request: SecureEnvelope,
        context: RpcRequestContext,
    ) -> Result<EnvelopeStream, TransportError>;
}
