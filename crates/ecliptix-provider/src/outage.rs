//! Outage gate: the single synchronization point that parks traffic while a
//! recovery is in flight.
//!
//! The gate is a CAS flag plus a watch-backed completion signal. Any number
//! of callers may wait for clearance; re-entering an outage replaces the
//! signal atomically, and disposal always completes waiters with a shutdown
//! error so nothing hangs.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::failure::NetworkFailure;

const CLEAR: u8 = 0;
const ACTIVE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutageSignal {
    Clear,
    Active,
    ShutDown,
}

pub struct OutageGate {
    flag: AtomicU8,
    signal: watch::Sender<OutageSignal>,
    shutdown: CancellationToken,
    recovery_cancel: Mutex<Option<CancellationToken>>,
}

impl OutageGate {
    /// `shutdown` is the provider-owned token; recovery tokens are children
    /// of it so disposal cancels any in-flight recovery.
    pub fn new(shutdown: CancellationToken) -> Self {
        let (signal, _) = watch::channel(OutageSignal::Clear);
        Self {
            flag: AtomicU8::new(CLEAR),
            signal,
            shutdown,
            recovery_cancel: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.flag.load(Ordering::Acquire) == ACTIVE
    }

    /// Enter the outage. Returns true for the caller that won the CAS and
    /// therefore owns the recovery; losers observe the existing outage.
    pub fn begin(&self) -> bool {
        let won = self
            .flag
            .compare_exchange(CLEAR, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.signal.send_replace(OutageSignal::Active);
            tracing::warn!("outage entered; traffic gated");
        }
        won
    }

    /// Clear the outage and wake every waiter. Returns true when this call
    /// performed the transition.
    pub fn exit(&self) -> bool {
        let won = self
            .flag
            .compare_exchange(ACTIVE, CLEAR, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            if let Some(token) = self.recovery_cancel.lock().take() {
                token.cancel();
            }
            self.signal.send_replace(OutageSignal::Clear);
            tracing::info!("outage cleared");
        }
        won
    }

    /// The cancellation token governing the current recovery loop, created
    /// on first use as a child of the shutdown token.
    pub fn recovery_token(&self) -> CancellationToken {
        let mut guard = self.recovery_cancel.lock();
        match guard.as_ref() {
            Some(token) if !token.is_cancelled() => token.clone(),
            _ => {
                let token = self.shutdown.child_token();
                *guard = Some(token.clone());
                token
            }
        }
    }

    /// Complete all current and future waits with a shutdown error.
    pub fn shut_down(&self) {
        if let Some(token) = self.recovery_cancel.lock().take() {
            token.cancel();
        }
        self.signal.send_replace(OutageSignal::ShutDown);
    }

    /// Park until the outage clears. Resolves immediately when no outage is
    /// active; fails on timeout, caller cancellation, or shutdown.
    pub async fn wait_cleared(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), NetworkFailure> {
        let mut rx = self.signal.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match *rx.borrow_and_update() {
                OutageSignal::Clear => return Ok(()),
                OutageSignal::ShutDown => {
                    return Err(NetworkFailure::server_shutdown("provider shutting down"));
                }
                OutageSignal::Active => {}
            }

            // Biased so a shutdown signal outranks a simultaneous caller
            // cancel: waiters must see the terminal state when both fire.
            tokio::select! {
                biased;
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(NetworkFailure::server_shutdown("provider dropped"));
                    }
                }
                () = cancel.cancelled() => {
                    return Err(NetworkFailure::cancelled("cancelled while waiting for recovery"));
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(NetworkFailure::not_responding(
                        "outage recovery timeout elapsed",
                    ));
                }
            }
        }
    }
}

impl Drop for OutageGate {
    fn drop(&mut self) {
        // Waiters must never hang on a dropped gate.
        self.signal.send_replace(OutageSignal::ShutDown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::NetworkFailureKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_is_immediate_when_clear() {
        let gate = OutageGate::new(CancellationToken::new());
        gate.wait_cleared(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn entry_cas_admits_one_owner() {
        let gate = OutageGate::new(CancellationToken::new());
        assert!(gate.begin());
        assert!(!gate.begin(), "second entry loses the CAS");
        assert!(gate.is_active());

        assert!(gate.exit());
        assert!(!gate.exit());
        assert!(!gate.is_active());
    }

    #[tokio::test]
    async fn waiters_are_released_on_exit() {
        let gate = Arc::new(OutageGate::new(CancellationToken::new()));
        gate.begin();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.wait_cleared(Duration::from_secs(5), &CancellationToken::new())
                    .await
            })
        };

        tokio::task::yield_now().await;
        gate.exit();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let gate = OutageGate::new(CancellationToken::new());
        gate.begin();

        let err = gate
            .wait_cleared(Duration::from_secs(30), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, NetworkFailureKind::DataCenterNotResponding);
    }

    #[tokio::test]
    async fn wait_honors_caller_cancellation() {
        let gate = Arc::new(OutageGate::new(CancellationToken::new()));
        gate.begin();

        let cancel = CancellationToken::new();
        let waiter = {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.wait_cleared(Duration::from_secs(30), &cancel).await
            })
        };

        tokio::task::yield_now().await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind, NetworkFailureKind::OperationCancelled);
    }

    #[tokio::test]
    async fn shutdown_completes_waiters_with_error() {
        let gate = Arc::new(OutageGate::new(CancellationToken::new()));
        gate.begin();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                gate.wait_cleared(Duration::from_secs(30), &CancellationToken::new())
                    .await
            })
        };

        tokio::task::yield_now().await;
        gate.shut_down();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind, NetworkFailureKind::DataCenterShutdown);
    }

    #[tokio::test]
    async fn recovery_token_is_recreated_after_cancel() {
        let gate = OutageGate::new(CancellationToken::new());
        let first = gate.recovery_token();
        gate.exit(); // no-op: not active; token untouched
        assert!(!first.is_cancelled());

        gate.begin();
        gate.exit(); // cancels the active recovery token
        assert!(first.is_cancelled());

        let second = gate.recovery_token();
        assert!(!second.is_cancelled());
    }
}
