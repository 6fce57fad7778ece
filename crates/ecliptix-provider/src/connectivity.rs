//! Connectivity status stream.
//!
//! Reachability probes and RPC outcomes arrive as intents; subscribers see a
//! deduplicated, monotonically sequenced snapshot over a watch channel
//! (last-value replay, so late subscribers always observe current state).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::watch;

/// Externally visible channel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectivityStatus {
    Unavailable,
    Connecting,
    Connected,
    Disconnected,
    Recovering,
    RetriesExhausted,
    ShuttingDown,
}

/// Where a status change originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusSource {
    Probe,
    Rpc,
    Manual,
    Lifecycle,
}

/// Input events merged into the status stream.
#[derive(Debug, Clone)]
pub enum ConnectivityIntent {
    InternetRecovered,
    InternetLost,
    Connecting { connect_id: u32 },
    Connected { connect_id: Option<u32> },
    Disconnected { reason: String, connect_id: Option<u32> },
    Recovering { reason: String },
    ServerShutdown { reason: String },
    RetriesExhausted { reason: String },
    ManualRetryRequested,
    Shutdown,
}

/// One deduplicated status observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivitySnapshot {
    pub status: ConnectivityStatus,
    pub reason: Option<String>,
    pub source: StatusSource,
    pub retry_attempt: u32,
    /// Monotonic sequence stamped at publish time.
    pub sequence: u64,
}

/// Publishes connectivity snapshots; intents in, deduplicated snapshots out.
pub struct ConnectivityHub {
    tx: watch::Sender<ConnectivitySnapshot>,
    sequence: AtomicU64,
    retry_attempt: AtomicU32,
}

impl ConnectivityHub {
    pub fn new() -> Self {
        let initial = ConnectivitySnapshot {
            status: ConnectivityStatus::Unavailable,
            reason: None,
            source: StatusSource::Lifecycle,
            retry_attempt: 0,
            sequence: 0,
        };
        let (tx, _rx) = watch::channel(initial);
        Self { tx, sequence: AtomicU64::new(1), retry_attempt: AtomicU32::new(0) }
    }

    /// Subscribe with last-value replay.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivitySnapshot> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> ConnectivitySnapshot {
        self.tx.borrow().clone()
    }

    /// Record the retry attempt surfaced in subsequent snapshots.
    pub fn note_retry_attempt(&self, attempt: u32) {
        self.retry_attempt.store(attempt, Ordering::Relaxed);
    }

    /// Merge one intent into the stream. Snapshots equal in status to the
    /// current one are coalesced away.
    pub fn publish(&self, intent: ConnectivityIntent) {
        let (status, reason, source) = match intent {
            ConnectivityIntent::InternetRecovered => {
                (ConnectivityStatus::Connecting, None, StatusSource::Probe)
            }
            ConnectivityIntent::InternetLost => (
                ConnectivityStatus::Unavailable,
                Some("internet unreachable".to_string()),
                StatusSource::Probe,
            ),
            ConnectivityIntent::Connecting { connect_id } => (
                ConnectivityStatus::Connecting,
                Some(format!("connect {connect_id}")),
                StatusSource::Rpc,
            ),
            ConnectivityIntent::Connected { .. } => {
                self.retry_attempt.store(0, Ordering::Relaxed);
                (ConnectivityStatus::Connected, None, StatusSource::Rpc)
            }
            ConnectivityIntent::Disconnected { reason, .. } => {
                (ConnectivityStatus::Disconnected, Some(reason), StatusSource::Rpc)
            }
            ConnectivityIntent::Recovering { reason } => {
                (ConnectivityStatus::Recovering, Some(reason), StatusSource::Rpc)
            }
            ConnectivityIntent::ServerShutdown { reason } => {
                (ConnectivityStatus::Disconnected, Some(reason), StatusSource::Rpc)
            }
            ConnectivityIntent::RetriesExhausted { reason } => {
                (ConnectivityStatus::RetriesExhausted, Some(reason), StatusSource::Rpc)
            }
            ConnectivityIntent::ManualRetryRequested => {
                (ConnectivityStatus::Connecting, None, StatusSource::Manual)
            }
            ConnectivityIntent::Shutdown => {
                (ConnectivityStatus::ShuttingDown, None, StatusSource::Lifecycle)
            }
        };

        if self.tx.borrow().status == status {
            return;
        }

        let snapshot = ConnectivitySnapshot {
            status,
            reason,
            source,
            retry_attempt: self.retry_attempt.load(Ordering::Relaxed),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        tracing::debug!(?status, source = ?snapshot.source, "connectivity changed");
        self.tx.send_replace(snapshot);
    }
}

impl Default for ConnectivityHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_statuses_are_coalesced() {
        let hub = ConnectivityHub::new();
        let rx = hub.subscribe();

        hub.publish(ConnectivityIntent::Connecting { connect_id: 1 });
        let seq_after_first = rx.borrow().sequence;
        hub.publish(ConnectivityIntent::Connecting { connect_id: 2 });
        assert_eq!(rx.borrow().sequence, seq_after_first, "same status coalesced");

        hub.publish(ConnectivityIntent::Connected { connect_id: Some(1) });
        assert_eq!(rx.borrow().status, ConnectivityStatus::Connected);
        assert!(rx.borrow().sequence > seq_after_first);
    }

    #[test]
    fn late_subscriber_sees_current_state() {
        let hub = ConnectivityHub::new();
        hub.publish(ConnectivityIntent::Recovering { reason: "probe lost".into() });

        let late = hub.subscribe();
        assert_eq!(late.borrow().status, ConnectivityStatus::Recovering);
        assert_eq!(late.borrow().reason.as_deref(), Some("probe lost"));
    }

    #[test]
    fn connected_resets_retry_attempt() {
        let hub = ConnectivityHub::new();
        hub.note_retry_attempt(4);
        hub.publish(ConnectivityIntent::Recovering { reason: "r".into() });
        assert_eq!(hub.current().retry_attempt, 4);

        hub.publish(ConnectivityIntent::Connected { connect_id: None });
        assert_eq!(hub.current().retry_attempt, 0);
    }
}
