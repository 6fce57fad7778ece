//! Reachability probe bridge.
//!
//! While an outage is active the provider polls the platform observer once
//! per `FAILURE_POLLING_INTERVAL` and feeds debounced transitions into the
//! connectivity FSM.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connectivity::{ConnectivityHub, ConnectivityIntent};
use crate::settings::{FAILURE_POLLING_INTERVAL, NETWORK_CHANGE_THROTTLE};

/// OS reachability seam.
#[async_trait]
pub trait ConnectivityObserver: Send + Sync {
    /// One reachability probe; true when the internet looks usable.
    async fn probe(&self) -> bool;
}

/// Poll `observer` until cancelled, publishing debounced transitions.
pub(crate) fn spawn_probe_bridge(
    observer: Arc<dyn ConnectivityObserver>,
    hub: Arc<ConnectivityHub>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // Assume reachable at outage entry; the first failed probe flips it.
        let mut reachable = true;
        let mut last_flip: Option<Instant> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(FAILURE_POLLING_INTERVAL) => {}
            }

            let observed = observer.probe().await;
            if observed == reachable {
                continue;
            }
            // Debounce flapping links.
            if last_flip.is_some_and(|t| t.elapsed() < NETWORK_CHANGE_THROTTLE) {
                continue;
            }
            reachable = observed;
            last_flip = Some(Instant::now());
            hub.publish(if reachable {
                ConnectivityIntent::InternetRecovered
            } else {
                ConnectivityIntent::InternetLost
            });
        }
        tracing::debug!("probe bridge stopped");
    })
}
