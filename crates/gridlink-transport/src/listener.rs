//! Inbound channel listener.
//!
//! Accepts peer drivers and worker nodes, learns their role from the hello
//! frame and keeps the registry entry alive for as long as the socket is.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gridlink_core::{ChannelId, GridError};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::hello::{read_hello, Hello};
use crate::link::{LinkCloser, LinkStream, PeerLink};
use crate::registry::ChannelRegistry;
use crate::tls::{build_server_config, TlsIdentity};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: String,
    /// Serve TLS with this identity; plain TCP when `None`.
    pub identity: Option<TlsIdentity>,
    pub hello_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:11111".to_string(),
            identity: None,
            hello_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerMetrics {
    pub accepted: u64,
    pub hello_failures: u64,
    pub disconnects: u64,
}

#[derive(Default)]
struct ListenerMetricsInner {
    accepted: AtomicU64,
    hello_failures: AtomicU64,
    disconnects: AtomicU64,
}

struct Shared {
    registry: Arc<ChannelRegistry>,
    tls: Option<Arc<ServerConfig>>,
    hello_timeout: Duration,
    poll_interval: Duration,
    running: AtomicBool,
    links: Mutex<HashMap<ChannelId, LinkCloser>>,
    metrics: ListenerMetricsInner,
}

impl Shared {
    fn links(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, LinkCloser>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ChannelListener {
    local_addr: SocketAddr,
    secure: bool,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ChannelListener {
    pub fn bind(config: ListenerConfig, registry: Arc<ChannelRegistry>) -> Result<Self, GridError> {
        let tls = config
            .identity
            .as_ref()
            .map(build_server_config)
            .transpose()?;
        let secure = tls.is_some();
        let shared = Arc::new(Shared {
            registry,
            tls,
            hello_timeout: config.hello_timeout,
            poll_interval: config.poll_interval,
            running: AtomicBool::new(true),
            links: Mutex::new(HashMap::new()),
            metrics: ListenerMetricsInner::default(),
        });

        let (startup_tx, startup_rx) = mpsc::sync_channel::<io::Result<SocketAddr>>(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let worker_shared = Arc::clone(&shared);
        let bind_addr = config.bind_addr.clone();
        let worker = thread::Builder::new()
            .name("gridlink-listener".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = startup_tx.send(Err(err));
                        return;
                    }
                };
                runtime.block_on(run_accept_loop(bind_addr, worker_shared, shutdown_rx, startup_tx));
                runtime.shutdown_timeout(Duration::from_secs(2));
            })?;

        let local_addr = match startup_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(addr)) => addr,
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(GridError::Io(err));
            }
            Err(_) => {
                return Err(GridError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "listener did not start",
                )))
            }
        };
        info!(
            "listening for channels on {} (secure={})",
            local_addr, secure
        );

        Ok(Self {
            local_addr,
            secure,
            shared,
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn metrics_snapshot(&self) -> ListenerMetrics {
        let m = &self.shared.metrics;
        ListenerMetrics {
            accepted: m.accepted.load(Ordering::Relaxed),
            hello_failures: m.hello_failures.load(Ordering::Relaxed),
            disconnects: m.disconnects.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting, closes every accepted channel and deregisters it.
    pub fn shutdown(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        self.shared.running.store(false, Ordering::Relaxed);
        for closer in self.shared.links().values() {
            closer.close();
        }
        let _ = shutdown_tx.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let leftovers: Vec<_> = self.shared.links().drain().collect();
        for (id, closer) in leftovers {
            closer.close();
            let _ = self.shared.registry.deregister(id);
        }
        info!("listener on {} stopped", self.local_addr);
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_accept_loop(
    bind_addr: String,
    shared: Arc<Shared>,
    mut shutdown_rx: oneshot::Receiver<()>,
    startup_tx: mpsc::SyncSender<io::Result<SocketAddr>>,
) {
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(err) => {
            warn!("channel listener bind failed on {}: {}", bind_addr, err);
            let _ = startup_tx.send(Err(err));
            return;
        }
    };
    match listener.local_addr() {
        Ok(addr) => {
            let _ = startup_tx.send(Ok(addr));
        }
        Err(err) => {
            let _ = startup_tx.send(Err(err));
            return;
        }
    }

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    shared.metrics.accepted.fetch_add(1, Ordering::Relaxed);
                    match stream.into_std() {
                        Ok(stream) => {
                            let shared = Arc::clone(&shared);
                            // Each channel owns a thread for its whole lifetime.
                            let spawned = thread::Builder::new()
                                .name(format!("gridlink-channel-{addr}"))
                                .spawn(move || serve_connection(stream, addr, shared));
                            if let Err(err) = spawned {
                                warn!("cannot serve connection from {}: {}", addr, err);
                            }
                        }
                        Err(err) => warn!("cannot detach connection from {}: {}", addr, err),
                    }
                }
                Err(err) => warn!("accept failed: {}", err),
            }
        }
    }
}

fn serve_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) {
    let (mut link, hello, closer) = match handshake(stream, &shared) {
        Ok(parts) => parts,
        Err(err) => {
            shared.metrics.hello_failures.fetch_add(1, Ordering::Relaxed);
            warn!("dropping connection from {}: {}", addr, err);
            return;
        }
    };

    let id = shared
        .registry
        .register(link.new_channel(hello.role, Some(hello.name)));
    shared.links().insert(id, closer);

    let end = link.monitor(&shared.running, shared.poll_interval);
    shared.links().remove(&id);
    if shared.registry.deregister(id).is_ok() {
        shared.metrics.disconnects.fetch_add(1, Ordering::Relaxed);
    }
    debug!("channel {} from {} ended: {:?}", id, addr, end);
}

fn handshake(
    mut stream: TcpStream,
    shared: &Shared,
) -> Result<(PeerLink, Hello, LinkCloser), GridError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(shared.hello_timeout))?;
    stream.set_write_timeout(Some(shared.hello_timeout))?;

    let mut link_stream = match &shared.tls {
        Some(config) => {
            let mut conn = ServerConnection::new(Arc::clone(config))
                .map_err(|err| GridError::Protocol(err.to_string()))?;
            while conn.is_handshaking() {
                conn.complete_io(&mut stream)?;
            }
            LinkStream::ServerTls(Box::new(StreamOwned::new(conn, stream)))
        }
        None => LinkStream::Plain(stream),
    };
    let hello = read_hello(&mut link_stream)?;
    let closer = link_stream.closer()?;
    Ok((PeerLink::new(link_stream)?, hello, closer))
}
