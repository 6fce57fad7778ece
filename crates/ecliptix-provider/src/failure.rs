//! Structured failure surface for every provider operation.

use thiserror::Error;

/// Failure taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkFailureKind {
    /// Transport timeout or unreachable data center.
    DataCenterNotResponding,
    /// Explicit server-side termination signal.
    DataCenterShutdown,
    /// Envelope parse or ratchet decrypt failed consistent with divergent state.
    ProtocolStateMismatch,
    /// Bootstrap chunk encrypt/decrypt or pin verification failed.
    RsaEncryption,
    /// Caller misuse: wrong flow, duplicate request, unknown retry mode.
    InvalidRequestType,
    /// Caller cancelled the operation.
    OperationCancelled,
    /// The retry policy gave up for this operation signature.
    RetriesExhausted,
    /// The server rejected the master-key-derived identity.
    CriticalAuthenticationFailure,
}

/// Server-correlatable error detail attached to user-visible failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserError {
    pub correlation_id: String,
    pub code: u32,
    pub localized_message_key: String,
}

/// A failed provider operation.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct NetworkFailure {
    pub kind: NetworkFailureKind,
    pub message: String,
    pub user_error: Option<UserError>,
    pub requires_reinit: bool,
}

impl NetworkFailure {
    pub fn new(kind: NetworkFailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), user_error: None, requires_reinit: false }
    }

    pub fn not_responding(message: impl Into<String>) -> Self {
        Self::new(NetworkFailureKind::DataCenterNotResponding, message)
    }

    pub fn server_shutdown(message: impl Into<String>) -> Self {
        Self::new(NetworkFailureKind::DataCenterShutdown, message)
    }

    pub fn protocol_mismatch(message: impl Into<String>) -> Self {
        Self::new(NetworkFailureKind::ProtocolStateMismatch, message)
    }

    pub fn rsa(message: impl Into<String>) -> Self {
        Self::new(NetworkFailureKind::RsaEncryption, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(NetworkFailureKind::InvalidRequestType, message)
    }

    pub fn duplicate_request(message: impl Into<String>) -> Self {
        Self::new(NetworkFailureKind::InvalidRequestType, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(NetworkFailureKind::OperationCancelled, message)
    }

    pub fn retries_exhausted(message: impl Into<String>) -> Self {
        Self::new(NetworkFailureKind::RetriesExhausted, message)
    }

    pub fn critical_auth(message: impl Into<String>) -> Self {
        Self::new(NetworkFailureKind::CriticalAuthenticationFailure, message)
    }

    /// Stamp a correlation id so logs can be joined to server traces.
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        match &mut self.user_error {
            Some(user) => user.correlation_id = correlation_id,
            None => {
                self.user_error = Some(UserError {
                    correlation_id,
                    code: 0,
                    localized_message_key: String::new(),
                });
            }
        }
        self
    }

    pub fn with_reinit(mut self) -> Self {
        self.requires_reinit = true;
        self
    }

    /// True for failures that gate traffic and enqueue recovery work.
    pub fn is_retryable_connectivity(&self) -> bool {
        matches!(
            self.kind,
            NetworkFailureKind::DataCenterNotResponding
                | NetworkFailureKind::DataCenterShutdown
                | NetworkFailureKind::ProtocolStateMismatch
                | NetworkFailureKind::RsaEncryption
        )
    }

    /// True for the subset a retry loop may actually re-attempt: protocol
    /// and pinning failures are never retried locally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            NetworkFailureKind::DataCenterNotResponding | NetworkFailureKind::DataCenterShutdown
        )
    }
}

impl From<ecliptix_crypto::CryptoError> for NetworkFailure {
    fn from(e: ecliptix_crypto::CryptoError) -> Self {
        Self::protocol_mismatch(e.to_string())
    }
}

impl From<ecliptix_proto::ProtoError> for NetworkFailure {
    fn from(e: ecliptix_proto::ProtoError) -> Self {
        match e {
            ecliptix_proto::ProtoError::RsaEncryption(msg) => Self::rsa(msg),
            other => Self::protocol_mismatch(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_is_attached_without_clobbering_detail() {
        let failure = NetworkFailure::not_responding("timed out")
            .with_correlation("corr-123");
        let user = failure.user_error.unwrap();
        assert_eq!(user.correlation_id, "corr-123");
        assert_eq!(failure.kind, NetworkFailureKind::DataCenterNotResponding);
    }

    #[test]
    fn retryable_classification_matches_taxonomy() {
        assert!(NetworkFailure::not_responding("x").is_retryable_connectivity());
        assert!(NetworkFailure::rsa("x").is_retryable_connectivity());
        assert!(!NetworkFailure::cancelled("x").is_retryable_connectivity());
        assert!(!NetworkFailure::rsa("x").is_transient());
        assert!(NetworkFailure::server_shutdown("x").is_transient());
    }
}
