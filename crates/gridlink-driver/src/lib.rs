//! Peer discovery and dispatch admission for a gridlink driver.

pub mod admission;
pub mod broadcast;
pub mod config;
pub mod diagnostics;
pub mod discovery;
pub mod driver;
pub mod sla;
pub mod stats;

pub use admission::{
    AdmissionEngine, AdmissionPolicy, AllOf, MaxNodesAdmission, NotSuspendedAdmission,
    PolicyRegistry, PriorityShareAdmission,
};
pub use broadcast::{Announcement, BroadcastConfig, BroadcastDiscovery, IpExclusion};
pub use config::DriverSettings;
pub use diagnostics::{verify_single_peer, TopologyReport};
pub use discovery::{
    DiscoveryConfig, DiscoveryMetrics, DiscoverySink, DriverDiscovery, PeerDiscoveryService,
    StaticPeerDiscovery,
};
pub use driver::Driver;
pub use sla::{DispatchCounter, DispatchTracker, JobSlaSnapshot};
pub use stats::{GridStatistics, StatSnapshot, StatisticsView, TopologyStatsObserver};
