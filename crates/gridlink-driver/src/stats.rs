//! Live grid statistics read by admission policies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use gridlink_core::ChannelRole;
use gridlink_transport::{ChannelInfo, ChannelObserver, ChannelRegistry};
use serde::Serialize;

/// Number of worker nodes currently connected.
pub const NODES: &str = "nodes";
/// Number of peer drivers currently connected.
pub const PEERS: &str = "peers";

/// Read-only access to the latest value of a labelled metric.
pub trait StatisticsView: Send + Sync {
    fn latest(&self, label: &str) -> Option<f64>;
}

impl StatisticsView for HashMap<String, f64> {
    fn latest(&self, label: &str) -> Option<f64> {
        self.get(label).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatSnapshot {
    pub label: String,
    pub latest: f64,
    pub total: f64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
}

impl StatSnapshot {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            latest: 0.0,
            total: 0.0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        }
    }

    fn track(&mut self, value: f64) {
        self.latest = value;
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Concurrent map of metric label to snapshot.
#[derive(Debug, Default)]
pub struct GridStatistics {
    snapshots: RwLock<HashMap<String, StatSnapshot>>,
}

impl GridStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics with the `nodes` and `peers` gauges present at 0.
    pub fn with_topology_gauges() -> Self {
        let stats = Self::new();
        stats.set_value(NODES, 0.0);
        stats.set_value(PEERS, 0.0);
        stats
    }

    /// Accumulates `value` into the snapshot for `label`.
    pub fn add_value(&self, label: &str, value: f64) {
        let mut map = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = map
            .entry(label.to_string())
            .or_insert_with(|| StatSnapshot::new(label));
        snapshot.total += value;
        snapshot.track(value);
    }

    /// Records a gauge reading: `total` is the reading itself.
    pub fn set_value(&self, label: &str, value: f64) {
        let mut map = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        let snapshot = map
            .entry(label.to_string())
            .or_insert_with(|| StatSnapshot::new(label));
        snapshot.total = value;
        snapshot.track(value);
    }

    pub fn get_snapshot(&self, label: &str) -> Option<StatSnapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .cloned()
    }

    pub fn remove(&self, label: &str) -> Option<StatSnapshot> {
        self.snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(label)
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<_> = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        labels.sort();
        labels
    }

    pub fn snapshots(&self) -> Vec<StatSnapshot> {
        let mut all: Vec<_> = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.label.cmp(&b.label));
        all
    }
}

impl StatisticsView for GridStatistics {
    fn latest(&self, label: &str) -> Option<f64> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(label)
            .map(|s| s.latest)
    }
}

/// Keeps the `nodes` and `peers` gauges equal to the registry counts.
pub struct TopologyStatsObserver {
    stats: Arc<GridStatistics>,
    // Serializes count-then-set so the last writer saw the latest count.
    refresh_lock: Mutex<()>,
}

impl TopologyStatsObserver {
    pub fn new(stats: Arc<GridStatistics>) -> Self {
        Self {
            stats,
            refresh_lock: Mutex::new(()),
        }
    }

    fn refresh(&self, registry: &ChannelRegistry, role: ChannelRole) {
        let label = match role {
            ChannelRole::Node => NODES,
            ChannelRole::Peer => PEERS,
        };
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.stats.set_value(label, registry.count(role) as f64);
    }
}

impl ChannelObserver for TopologyStatsObserver {
    fn on_registered(&self, registry: &ChannelRegistry, channel: &ChannelInfo) {
        self.refresh(registry, channel.role);
    }

    fn on_deregistered(&self, registry: &ChannelRegistry, channel: &ChannelInfo) {
        self.refresh(registry, channel.role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridlink_core::SelectionKey;
    use gridlink_transport::NewChannel;
    use std::net::SocketAddr;

    #[test]
    fn add_value_accumulates() {
        let stats = GridStatistics::new();
        stats.add_value("latency", 4.0);
        stats.add_value("latency", 2.0);
        let snap = stats.get_snapshot("latency").expect("snapshot");
        assert_eq!(snap.latest, 2.0);
        assert_eq!(snap.total, 6.0);
        assert_eq!(snap.count, 2);
        assert_eq!(snap.min, 2.0);
        assert_eq!(snap.max, 4.0);
        assert_eq!(snap.avg(), 3.0);
    }

    #[test]
    fn set_value_records_a_gauge() {
        let stats = GridStatistics::with_topology_gauges();
        assert_eq!(stats.latest(NODES), Some(0.0));
        stats.set_value(NODES, 5.0);
        stats.set_value(NODES, 3.0);
        let snap = stats.get_snapshot(NODES).expect("snapshot");
        assert_eq!(snap.latest, 3.0);
        assert_eq!(snap.total, 3.0);
        assert_eq!(snap.max, 5.0);
        assert_eq!(stats.labels(), vec![NODES.to_string(), PEERS.to_string()]);
        assert!(stats.latest("missing").is_none());
    }

    #[test]
    fn observer_tracks_registry_counts() {
        let stats = Arc::new(GridStatistics::with_topology_gauges());
        let registry = ChannelRegistry::new();
        registry.add_observer(Arc::new(TopologyStatsObserver::new(Arc::clone(&stats))));

        let channel = |role| NewChannel {
            role,
            secure: false,
            local_port: 11111,
            remote_addr: SocketAddr::from(([127, 0, 0, 1], 40000)),
            name: None,
            selection_key: SelectionKey(1),
        };
        let n1 = registry.register(channel(ChannelRole::Node));
        registry.register(channel(ChannelRole::Node));
        registry.register(channel(ChannelRole::Peer));
        assert_eq!(stats.latest(NODES), Some(2.0));
        assert_eq!(stats.latest(PEERS), Some(1.0));

        registry.deregister(n1).expect("deregister");
        assert_eq!(stats.latest(NODES), Some(1.0));
        assert_eq!(stats.latest(PEERS), Some(1.0));
    }
}
