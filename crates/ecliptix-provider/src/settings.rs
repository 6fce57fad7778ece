//! Installation-scoped settings and environment constants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fallback culture when the host platform reports none.
pub const DEFAULT_CULTURE_CODE: &str = "en-US";

/// Longest a caller may wait for outage clearance before failing.
pub const OUTAGE_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Debounce window for reachability flaps from the probe bridge.
pub const NETWORK_CHANGE_THROTTLE: Duration = Duration::from_millis(500);

/// Probe cadence while an outage is active.
pub const FAILURE_POLLING_INTERVAL: Duration = Duration::from_secs(1);

/// Identity of one application installation on one device.
///
/// `membership_id` is the opaque tenant binding every persisted record is
/// scoped by; it is never interpreted, only forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInstanceSettings {
    pub app_instance_id: [u8; 16],
    pub device_id: [u8; 16],
    pub membership_id: String,
    pub culture: String,
}

impl ApplicationInstanceSettings {
    pub fn new(app_instance_id: [u8; 16], device_id: [u8; 16], membership_id: impl Into<String>) -> Self {
        Self {
            app_instance_id,
            device_id,
            membership_id: membership_id.into(),
            culture: DEFAULT_CULTURE_CODE.to_string(),
        }
    }
}
