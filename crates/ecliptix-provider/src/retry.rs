//! Per-service retry policy and backoff execution.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng as _;
use tokio_util::sync::CancellationToken;

use crate::connectivity::{ConnectivityHub, ConnectivityIntent};
use crate::failure::NetworkFailure;
use crate::transport::ServiceType;

/// First backoff delay.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Retry behavior for one service.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `None` retries until cancelled.
    pub max_retries: Option<u32>,
    /// Whether a final failure on this service demands protocol reinit.
    pub reinit_on_complete_failure: bool,
}

impl RetryPolicy {
    pub fn for_service(service: ServiceType) -> Self {
        match service {
            ServiceType::EstablishChannel
            | ServiceType::EstablishAuthenticatedChannel
            | ServiceType::RestoreChannel => {
                Self { max_retries: None, reinit_on_complete_failure: false }
            }
            ServiceType::SignInComplete | ServiceType::SignUpComplete => {
                Self { max_retries: Some(2), reinit_on_complete_failure: true }
            }
            ServiceType::VerificationStream | ServiceType::DataWrite => {
                Self { max_retries: Some(0), reinit_on_complete_failure: false }
            }
            ServiceType::DataRead | ServiceType::Ping => {
                Self { max_retries: Some(2), reinit_on_complete_failure: false }
            }
        }
    }
}

/// Exponential backoff with full jitter: uniform in (0, min(cap, base * 2^n)].
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    let ceiling = BACKOFF_BASE
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_CAP)
        .as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(1..=ceiling.max(1)))
}

/// Executes RPC closures under the per-service policy and tracks which
/// `(connect_id, service)` signatures have burned their retry budget.
pub struct RetryStrategy {
    hub: Arc<ConnectivityHub>,
    exhausted: Mutex<HashSet<(u32, ServiceType)>>,
}

impl RetryStrategy {
    pub fn new(hub: Arc<ConnectivityHub>) -> Self {
        Self { hub, exhausted: Mutex::new(HashSet::new()) }
    }

    /// Run `op` with retries per policy. `max_retries` overrides the policy
    /// budget when provided. `op` receives the 1-based attempt number.
    pub async fn execute_rpc<T, F, Fut>(
        &self,
        op: F,
        operation_name: &str,
        connect_id: u32,
        service: ServiceType,
        max_retries: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<T, NetworkFailure>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, NetworkFailure>>,
    {
        if self.is_exhausted(connect_id, service) {
            return Err(NetworkFailure::retries_exhausted(format!(
                "{operation_name}: retry budget previously exhausted for connect {connect_id}"
            )));
        }

        let budget = max_retries.or_else(|| RetryPolicy::for_service(service).max_retries);
        let mut attempt: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(NetworkFailure::cancelled(format!("{operation_name}: cancelled")));
            }

            match op(attempt).await {
                Ok(value) => {
                    self.mark_connection_healthy(connect_id);
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    let out_of_budget = budget.is_some_and(|b| attempt > b);
                    if out_of_budget {
                        // A zero-retry policy failing once is not "exhausted";
                        // only a real retry budget burning down poisons the
                        // signature.
                        if budget != Some(0) {
                            self.exhausted.lock().insert((connect_id, service));
                            self.hub.publish(ConnectivityIntent::RetriesExhausted {
                                reason: format!("{operation_name}: {e}"),
                            });
                            return Err(NetworkFailure::retries_exhausted(format!(
                                "{operation_name}: gave up after {attempt} attempts: {e}"
                            )));
                        }
                        return Err(e);
                    }

                    self.hub.note_retry_attempt(attempt);
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        connect_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "rpc attempt failed, backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(NetworkFailure::cancelled(format!(
                                "{operation_name}: cancelled during backoff"
                            )));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Manual-retry gate: clears the exhausted mark for this signature and
    /// runs exactly one attempt.
    pub async fn execute_manual_retry_rpc<T, F, Fut>(
        &self,
        op: F,
        operation_name: &str,
        connect_id: u32,
        service: ServiceType,
        cancel: &CancellationToken,
    ) -> Result<T, NetworkFailure>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, NetworkFailure>>,
    {
        self.exhausted.lock().remove(&(connect_id, service));
        self.execute_rpc(op, operation_name, connect_id, service, Some(0), cancel)
            .await
    }

    /// Drop every exhausted mark for a connect id after verified traffic.
    pub fn mark_connection_healthy(&self, connect_id: u32) {
        self.exhausted.lock().retain(|(id, _)| *id != connect_id);
    }

    /// Drop all exhausted marks (manual-retry surface).
    pub fn clear_exhausted(&self) {
        self.exhausted.lock().clear();
    }

    pub fn is_exhausted(&self, connect_id: u32, service: ServiceType) -> bool {
        self.exhausted.lock().contains(&(connect_id, service))
    }
}
