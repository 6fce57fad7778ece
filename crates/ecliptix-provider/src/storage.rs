//! Secure persistent storage seam.
//!
//! Blob-keyed store with an opaque membership binding. Encryption at rest is
//! the implementor's contract; the provider only shapes keys and values.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(String),

    #[error("stored record corrupt: {0}")]
    Corrupt(String),
}

/// Blob store scoped by `(membership_id, key)`.
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn put(&self, membership_id: &str, key: &str, value: Vec<u8>)
        -> Result<(), StorageError>;

    async fn get(&self, membership_id: &str, key: &str)
        -> Result<Option<Vec<u8>>, StorageError>;

    async fn remove(&self, membership_id: &str, key: &str) -> Result<(), StorageError>;
}

/// Storage key for a session blob.
pub fn session_key(connect_id: u32) -> String {
    connect_id.to_string()
}

/// Storage key for the last-persisted wall clock of a session.
pub fn timestamp_key(connect_id: u32) -> String {
    format!("{connect_id}_timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable() {
        assert_eq!(session_key(42), "42");
        assert_eq!(timestamp_key(42), "42_timestamp");
    }
}
