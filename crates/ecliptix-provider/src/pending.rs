//! Durable queue of resume-on-recovery closures.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ecliptix_crypto::ExchangeType;

use crate::failure::NetworkFailure;

/// A registered resume closure; invoked with a token linked to shutdown.
pub type ResumeFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<(), NetworkFailure>> + Send + Sync>;

/// Pending-request key for a failed channel establishment.
pub fn establish_key(connect_id: u32, exchange_type: ExchangeType) -> String {
    let tag = match exchange_type {
        ExchangeType::EphemeralConnect => "ephemeral-connect",
        ExchangeType::ServerStreaming => "server-streaming",
    };
    format!("secrecy-channel:{connect_id}:{tag}")
}

/// Pending-request key for a failed channel restore.
pub fn restore_key(connect_id: u32) -> String {
    format!("secrecy-channel-restore:{connect_id}")
}

/// Registry of work to replay once an outage clears.
///
/// Registration is idempotent by key. Replay runs sequentially under a
/// single-permit gate; a resume that succeeds removes its own entry, a
/// resume that fails is logged and left registered for the next recovery.
pub struct PendingRequestManager {
    entries: Mutex<BTreeMap<String, ResumeFn>>,
    replay_gate: tokio::sync::Mutex<()>,
}

impl PendingRequestManager {
    pub fn new() -> Self {
        Self { entries: Mutex::new(BTreeMap::new()), replay_gate: tokio::sync::Mutex::new(()) }
    }

    /// Register `resume` under `key`; an existing registration wins.
    pub fn register(&self, key: impl Into<String>, resume: ResumeFn) {
        let key = key.into();
        let mut entries = self.entries.lock();
        match entries.entry(key) {
            std::collections::btree_map::Entry::Occupied(slot) => {
                tracing::debug!(key = %slot.key(), "pending request already registered");
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                tracing::info!(key = %slot.key(), "pending request registered");
                slot.insert(resume);
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if self.entries.lock().remove(key).is_some() {
            tracing::debug!(key, "pending request removed");
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Invoke every registered resume sequentially. Entries remove
    /// themselves on success; failures stay queued.
    pub async fn retry_all(&self, cancel: &CancellationToken) {
        let _permit = self.replay_gate.lock().await;

        let snapshot: Vec<(String, ResumeFn)> = self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        tracing::info!(count = snapshot.len(), "replaying pending requests");
        for (key, resume) in snapshot {
            if cancel.is_cancelled() {
                tracing::debug!("pending replay cancelled");
                return;
            }
            match resume(cancel.child_token()).await {
                Ok(()) => tracing::debug!(key = %key, "pending request resumed"),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "pending request resume failed");
                }
            }
        }
    }
}

impl Default for PendingRequestManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_resume(counter: Arc<AtomicU32>) -> ResumeFn {
        Arc::new(move |_cancel| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn registration_is_idempotent_by_key() {
        let pending = PendingRequestManager::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        pending.register("k", counting_resume(Arc::clone(&first)));
        pending.register("k", counting_resume(Arc::clone(&second)));
        assert_eq!(pending.len(), 1);

        pending.retry_all(&CancellationToken::new()).await;
        assert_eq!(first.load(Ordering::SeqCst), 1, "original registration kept");
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_resume_stays_registered() {
        let pending = PendingRequestManager::new();
        pending.register(
            "broken",
            Arc::new(|_| {
                Box::pin(async { Err(NetworkFailure::not_responding("still down")) })
            }),
        );

        pending.retry_all(&CancellationToken::new()).await;
        assert!(pending.contains("broken"));
    }

    #[tokio::test]
    async fn successful_resume_can_remove_itself() {
        let pending = Arc::new(PendingRequestManager::new());
        let pending_for_resume = Arc::clone(&pending);
        pending.register(
            "once",
            Arc::new(move |_| {
                let pending = Arc::clone(&pending_for_resume);
                Box::pin(async move {
                    pending.remove("once");
                    Ok(())
                })
            }),
        );

        pending.retry_all(&CancellationToken::new()).await;
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn cancelled_replay_stops_early() {
        let pending = PendingRequestManager::new();
        let counter = Arc::new(AtomicU32::new(0));
        pending.register("a", counting_resume(Arc::clone(&counter)));
        pending.register("b", counting_resume(Arc::clone(&counter)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        pending.retry_all(&cancel).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn keys_are_stable() {
        assert_eq!(
            establish_key(42, ExchangeType::EphemeralConnect),
            "secrecy-channel:42:ephemeral-connect"
        );
        assert_eq!(restore_key(42), "secrecy-channel-restore:42");
    }
}
