use std::net::SocketAddr;
use std::sync::Arc;

use gridlink_core::GridError;
use gridlink_transport::{ChannelListener, ChannelRegistry, PeerConnector, TcpPeerConnector};
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionEngine, PolicyRegistry};
use crate::broadcast::{Announcement, BroadcastDiscovery};
use crate::config::DriverSettings;
use crate::diagnostics::{self, TopologyReport};
use crate::discovery::{DriverDiscovery, PeerDiscoveryService, StaticPeerDiscovery};
use crate::stats::{GridStatistics, TopologyStatsObserver};

/// Owns the registry, statistics, admission engine, discovery service and
/// listener of one driver process.
pub struct Driver {
    name: String,
    instance_id: String,
    registry: Arc<ChannelRegistry>,
    stats: Arc<GridStatistics>,
    admission: Arc<AdmissionEngine>,
    discovery: PeerDiscoveryService,
    listener: Option<ChannelListener>,
}

impl Driver {
    pub fn start(settings: DriverSettings) -> Result<Self, GridError> {
        let mut connector_config = settings.connector.clone();
        connector_config.local_name = settings.driver_name.clone();
        let connector = Arc::new(TcpPeerConnector::new(connector_config)?);
        Self::start_with(settings, connector, PolicyRegistry::with_builtin())
    }

    /// Like [`Driver::start`] with a caller-provided connector and policy set.
    pub fn start_with(
        settings: DriverSettings,
        connector: Arc<dyn PeerConnector>,
        policies: PolicyRegistry,
    ) -> Result<Self, GridError> {
        let registry = Arc::new(ChannelRegistry::new());
        let stats = Arc::new(GridStatistics::with_topology_gauges());
        registry.add_observer(Arc::new(TopologyStatsObserver::new(Arc::clone(&stats))));
        let admission = Arc::new(AdmissionEngine::new(
            Arc::clone(&stats),
            policies,
            settings.default_admission_policy.clone(),
        )?);

        let listener = settings
            .listener
            .clone()
            .map(|config| ChannelListener::bind(config, Arc::clone(&registry)))
            .transpose()?;
        let discovery =
            PeerDiscoveryService::new(settings.discovery.clone(), Arc::clone(&registry), connector)?;

        let driver = Self {
            name: settings.driver_name.clone(),
            instance_id: Uuid::new_v4().to_string(),
            registry,
            stats,
            admission,
            discovery,
            listener,
        };

        if !settings.static_peers.is_empty() {
            let mut strategy = StaticPeerDiscovery::new(settings.static_peers.clone());
            if let Some(interval) = settings.static_retry {
                strategy = strategy.with_retry(interval);
            }
            driver.add_driver_discovery(strategy)?;
        }
        if let Some(mut broadcast) = settings.broadcast.clone() {
            if settings.broadcast_announce {
                match &driver.listener {
                    Some(listener) => {
                        broadcast.announce = Some(Announcement {
                            instance: driver.instance_id.clone(),
                            name: driver.name.clone(),
                            host: String::new(),
                            port: listener.local_addr().port(),
                            secure: listener.is_secure(),
                        });
                    }
                    None => warn!("broadcast announce requested without a listener; listening only"),
                }
            }
            driver.add_driver_discovery(BroadcastDiscovery::bind(broadcast, driver.instance_id.clone())?)?;
        }

        info!(
            "driver '{}' started (instance={}, listener={:?})",
            driver.name,
            driver.instance_id,
            driver.listener_addr()
        );
        Ok(driver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Random per-process id; tells this driver's announcements apart from
    /// others sharing its name.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn add_driver_discovery<D: DriverDiscovery>(&self, strategy: D) -> Result<(), GridError> {
        self.discovery.add_driver_discovery(strategy)
    }

    pub fn admission(&self) -> &Arc<AdmissionEngine> {
        &self.admission
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn statistics(&self) -> &Arc<GridStatistics> {
        &self.stats
    }

    pub fn discovery(&self) -> &PeerDiscoveryService {
        &self.discovery
    }

    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(ChannelListener::local_addr)
    }

    pub fn topology(&self) -> TopologyReport {
        TopologyReport::collect(&self.discovery, &self.registry, &self.stats)
    }

    pub fn verify_single_peer(&self) -> String {
        diagnostics::verify_single_peer(&self.discovery, &self.registry)
    }

    /// Stops discovery and the listener; every channel is deregistered.
    pub fn shutdown(&mut self) {
        if !self.discovery.is_running() && self.listener.is_none() {
            return;
        }
        self.discovery.shutdown();
        if let Some(mut listener) = self.listener.take() {
            listener.shutdown();
        }
        info!("driver '{}' stopped", self.name);
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
