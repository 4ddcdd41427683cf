use std::time::Duration;

use gridlink_core::PeerDescriptor;
use gridlink_transport::{ConnectorConfig, ListenerConfig};

use crate::admission::PRIORITY_SHARE;
use crate::broadcast::BroadcastConfig;
use crate::discovery::DiscoveryConfig;

/// Everything [`crate::Driver::start`] needs.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub driver_name: String,
    /// `local_name` is overwritten with `driver_name` at startup.
    pub connector: ConnectorConfig,
    pub discovery: DiscoveryConfig,
    /// Accept inbound peer and node channels when set.
    pub listener: Option<ListenerConfig>,
    pub static_peers: Vec<PeerDescriptor>,
    /// Re-report static peers this often so dropped ones reconnect.
    pub static_retry: Option<Duration>,
    pub broadcast: Option<BroadcastConfig>,
    /// Announce the listener over broadcast. Needs both `listener` and `broadcast`.
    pub broadcast_announce: bool,
    pub default_admission_policy: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            driver_name: "gridlink-driver".to_string(),
            connector: ConnectorConfig::default(),
            discovery: DiscoveryConfig::default(),
            listener: None,
            static_peers: Vec::new(),
            static_retry: None,
            broadcast: None,
            broadcast_announce: false,
            default_admission_policy: PRIORITY_SHARE.to_string(),
        }
    }
}
