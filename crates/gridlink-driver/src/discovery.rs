//! Peer discovery service.
//!
//! Strategies run on their own threads and report peers through a
//! [`DiscoverySink`]. A worker thread owning a current-thread runtime
//! dedups reports and connects to each new peer on a dedicated thread; the
//! resulting channel stays registered until the link drops or the service
//! shuts down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gridlink_core::{ChannelId, ChannelRole, GridError, PeerDescriptor};
use gridlink_transport::{ChannelRegistry, LinkCloser, LinkEnd, PeerConnector};
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, info, warn};

/// A pluggable way of finding peer drivers.
pub trait DriverDiscovery: Send + 'static {
    fn name(&self) -> &str;

    /// Runs until the strategy is done or `sink.is_stopped()`.
    fn discover(&mut self, sink: DiscoverySink);
}

struct Discovered {
    strategy: String,
    peer: PeerDescriptor,
}

/// Handed to a strategy to report peers.
#[derive(Clone)]
pub struct DiscoverySink {
    strategy: String,
    tx: tokio_mpsc::UnboundedSender<Discovered>,
    running: Arc<AtomicBool>,
}

impl DiscoverySink {
    /// Reports a peer. Returns `false` once the service is stopping.
    pub fn new_connection(&self, peer: PeerDescriptor) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.tx
            .send(Discovered {
                strategy: self.strategy.clone(),
                peer,
            })
            .is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        !self.running.load(Ordering::Relaxed)
    }

    /// Sleeps for `duration` or until the service stops.
    ///
    /// Returns `false` if it woke up because of a stop.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
        false
    }
}

/// Reports a fixed list of peers.
///
/// With a retry interval the list is reported again periodically so peers
/// that failed or disconnected get another connection attempt.
#[derive(Debug, Clone)]
pub struct StaticPeerDiscovery {
    peers: Vec<PeerDescriptor>,
    retry_interval: Option<Duration>,
}

impl StaticPeerDiscovery {
    pub fn new(peers: Vec<PeerDescriptor>) -> Self {
        Self {
            peers,
            retry_interval: None,
        }
    }

    pub fn with_retry(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }
}

impl DriverDiscovery for StaticPeerDiscovery {
    fn name(&self) -> &str {
        "static"
    }

    fn discover(&mut self, sink: DiscoverySink) {
        loop {
            for peer in &self.peers {
                if !sink.new_connection(peer.clone()) {
                    return;
                }
            }
            match self.retry_interval {
                Some(interval) if sink.wait(interval) => {}
                _ => return,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How often link monitors check for a stop request.
    pub poll_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryMetrics {
    pub discovered: u64,
    pub duplicates: u64,
    pub connect_attempts: u64,
    pub connect_ok: u64,
    pub connect_err: u64,
    pub disconnects: u64,
}

#[derive(Default)]
struct DiscoveryMetricsInner {
    discovered: AtomicU64,
    duplicates: AtomicU64,
    connect_attempts: AtomicU64,
    connect_ok: AtomicU64,
    connect_err: AtomicU64,
    disconnects: AtomicU64,
}

struct PeerLinkHandle {
    peer: PeerDescriptor,
    closer: LinkCloser,
}

struct Shared {
    registry: Arc<ChannelRegistry>,
    connector: Arc<dyn PeerConnector>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    // Discovery order.
    peers: Mutex<Vec<PeerDescriptor>>,
    links: Mutex<HashMap<ChannelId, PeerLinkHandle>>,
    metrics: DiscoveryMetricsInner,
}

impl Shared {
    fn peers(&self) -> MutexGuard<'_, Vec<PeerDescriptor>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<ChannelId, PeerLinkHandle>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Records `peer` unless already known. Returns whether it was new.
    fn remember(&self, peer: &PeerDescriptor) -> bool {
        let mut peers = self.peers();
        if peers.contains(peer) {
            false
        } else {
            peers.push(peer.clone());
            true
        }
    }

    fn forget(&self, peer: &PeerDescriptor) {
        self.peers().retain(|known| known != peer);
    }
}

pub struct PeerDiscoveryService {
    shared: Arc<Shared>,
    events_tx: tokio_mpsc::UnboundedSender<Discovered>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    strategies: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerDiscoveryService {
    pub fn new(
        config: DiscoveryConfig,
        registry: Arc<ChannelRegistry>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self, GridError> {
        let shared = Arc::new(Shared {
            registry,
            connector,
            running: Arc::new(AtomicBool::new(true)),
            poll_interval: config.poll_interval,
            peers: Mutex::new(Vec::new()),
            links: Mutex::new(HashMap::new()),
            metrics: DiscoveryMetricsInner::default(),
        });
        let (events_tx, events_rx) = tokio_mpsc::unbounded_channel::<Discovered>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (startup_tx, startup_rx) = mpsc::sync_channel::<Result<(), String>>(1);

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("gridlink-discovery".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = startup_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                let _ = startup_tx.send(Ok(()));
                runtime.block_on(run_discovery_worker(worker_shared, events_rx, shutdown_rx));
                runtime.shutdown_timeout(Duration::from_secs(2));
            })?;

        match startup_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(GridError::configuration(format!(
                    "discovery worker failed to start: {err}"
                )));
            }
            Err(_) => {
                return Err(GridError::configuration(
                    "discovery worker did not start".to_string(),
                ))
            }
        }

        Ok(Self {
            shared,
            events_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
            strategies: Mutex::new(Vec::new()),
        })
    }

    /// Starts `strategy` on its own thread and returns immediately.
    pub fn add_driver_discovery<D: DriverDiscovery>(&self, mut strategy: D) -> Result<(), GridError> {
        if !self.shared.is_running() {
            return Err(GridError::configuration(
                "discovery service is shut down".to_string(),
            ));
        }
        let name = strategy.name().to_string();
        let sink = DiscoverySink {
            strategy: name.clone(),
            tx: self.events_tx.clone(),
            running: Arc::clone(&self.shared.running),
        };
        let handle = thread::Builder::new()
            .name(format!("gridlink-discovery-{name}"))
            .spawn(move || strategy.discover(sink))?;
        info!("discovery strategy '{}' started", name);
        self.strategies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    /// Peers discovered and not failed, in discovery order.
    pub fn get_discovered_peers(&self) -> Vec<PeerDescriptor> {
        self.shared.peers().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn metrics_snapshot(&self) -> DiscoveryMetrics {
        let m = &self.shared.metrics;
        DiscoveryMetrics {
            discovered: m.discovered.load(Ordering::Relaxed),
            duplicates: m.duplicates.load(Ordering::Relaxed),
            connect_attempts: m.connect_attempts.load(Ordering::Relaxed),
            connect_ok: m.connect_ok.load(Ordering::Relaxed),
            connect_err: m.connect_err.load(Ordering::Relaxed),
            disconnects: m.disconnects.load(Ordering::Relaxed),
        }
    }

    /// Stops strategies, closes every discovery channel and deregisters it.
    ///
    /// Strategy threads still blocked inside `discover` are left to exit
    /// on their own once they observe the stop.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::Relaxed) {
            return;
        }
        for handle in self.shared.links().values() {
            handle.closer.close();
        }
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.join();
        }

        let leftovers: Vec<_> = self.shared.links().drain().collect();
        for (id, handle) in leftovers {
            handle.closer.close();
            if self.shared.registry.deregister(id).is_ok() {
                self.shared.metrics.disconnects.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.shared.peers().clear();

        let strategies: Vec<_> = self
            .strategies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in strategies {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        info!("peer discovery stopped");
    }
}

impl Drop for PeerDiscoveryService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_discovery_worker(
    shared: Arc<Shared>,
    mut events: tokio_mpsc::UnboundedReceiver<Discovered>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            maybe_event = events.recv() => {
                let Some(Discovered { strategy, peer }) = maybe_event else {
                    break;
                };
                if !shared.remember(&peer) {
                    shared.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                    debug!("'{}' reported known peer {}", strategy, peer);
                    continue;
                }
                shared.metrics.discovered.fetch_add(1, Ordering::Relaxed);
                info!("'{}' discovered peer {}", strategy, peer);
                let link_shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("gridlink-peer-{}", peer.address()))
                    .spawn({
                        let peer = peer.clone();
                        move || connect_and_monitor(&link_shared, peer)
                    });
                if let Err(err) = spawned {
                    warn!("cannot start link to peer {}: {}", peer, err);
                    shared.forget(&peer);
                }
            }
        }
    }
}

fn connect_and_monitor(shared: &Shared, peer: PeerDescriptor) {
    shared
        .metrics
        .connect_attempts
        .fetch_add(1, Ordering::Relaxed);
    let link = shared
        .connector
        .connect(&peer)
        .and_then(|link| Ok((link.stream.closer()?, link)));
    let (closer, mut link) = match link {
        Ok(parts) => parts,
        Err(err) => {
            shared.metrics.connect_err.fetch_add(1, Ordering::Relaxed);
            warn!("{}", err);
            shared.forget(&peer);
            return;
        }
    };
    if !shared.is_running() {
        return;
    }

    let id = shared
        .registry
        .register(link.new_channel(ChannelRole::Peer, Some(peer.name().to_string())));
    shared.links().insert(
        id,
        PeerLinkHandle {
            peer: peer.clone(),
            closer,
        },
    );
    shared.metrics.connect_ok.fetch_add(1, Ordering::Relaxed);
    info!("connected to peer {} on channel {}", peer, id);

    let end = link.monitor(&shared.running, shared.poll_interval);
    shared.links().remove(&id);
    if shared.registry.deregister(id).is_ok() {
        shared.metrics.disconnects.fetch_add(1, Ordering::Relaxed);
    }
    if end != LinkEnd::Stopped {
        info!("peer {} disconnected ({:?})", peer, end);
        shared.forget(&peer);
    }
}

impl std::fmt::Debug for PeerDiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers: Vec<String> = self
            .shared
            .links()
            .values()
            .map(|h| h.peer.to_string())
            .collect();
        f.debug_struct("PeerDiscoveryService")
            .field("running", &self.is_running())
            .field("linked_peers", &peers)
            .finish()
    }
}
