use gridlink_core::PeerDescriptor;
use gridlink_transport::{ChannelInfo, ChannelRegistry};
use serde::Serialize;

use crate::discovery::PeerDiscoveryService;
use crate::stats::{GridStatistics, StatSnapshot};

/// Current peers, channels and statistics, for operators and test harnesses.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyReport {
    pub peers: Vec<PeerDescriptor>,
    pub channels: Vec<ChannelInfo>,
    pub statistics: Vec<StatSnapshot>,
}

impl TopologyReport {
    pub fn collect(
        discovery: &PeerDiscoveryService,
        registry: &ChannelRegistry,
        stats: &GridStatistics,
    ) -> Self {
        Self {
            peers: discovery.get_discovered_peers(),
            channels: registry.list_channels(),
            statistics: stats.snapshots(),
        }
    }

    pub fn peer_channel_count(&self) -> usize {
        self.channels.iter().filter(|c| c.is_peer()).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// `"ok"` for exactly one discovered peer backed by exactly one peer
/// channel, otherwise `"ko: size=N"` or `"ko: channels=N"`.
pub fn verify_single_peer(discovery: &PeerDiscoveryService, registry: &ChannelRegistry) -> String {
    single_peer_verdict(
        discovery.get_discovered_peers().len(),
        registry.peer_channels().len(),
    )
}

pub fn single_peer_verdict(discovered: usize, peer_channels: usize) -> String {
    if discovered != 1 {
        format!("ko: size={discovered}")
    } else if peer_channels != 1 {
        format!("ko: channels={peer_channels}")
    } else {
        "ok".to_string()
    }
}
