use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use gridlink_core::{GridError, PeerDescriptor};
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::debug;

use crate::hello::{write_hello, Hello};
use crate::link::{LinkStream, PeerLink};
use crate::tls::{self, TlsTrust};

/// Opens an outbound link to a discovered peer driver.
pub trait PeerConnector: Send + Sync + 'static {
    fn connect(&self, peer: &PeerDescriptor) -> Result<PeerLink, GridError>;
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Name sent to peers in the hello frame.
    pub local_name: String,
    pub connect_timeout: Duration,
    pub tls_trust: TlsTrust,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            local_name: "gridlink-driver".to_string(),
            connect_timeout: Duration::from_secs(5),
            tls_trust: TlsTrust::default(),
        }
    }
}

/// TCP connector with an optional rustls client handshake.
pub struct TcpPeerConnector {
    config: ConnectorConfig,
    tls: Arc<ClientConfig>,
}

impl TcpPeerConnector {
    pub fn new(config: ConnectorConfig) -> Result<Self, GridError> {
        let tls = tls::build_client_config(&config.tls_trust)?;
        Ok(Self { config, tls })
    }

    fn open(&self, peer: &PeerDescriptor) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in peer.address().to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
        }))
    }

    fn establish(&self, peer: &PeerDescriptor) -> Result<PeerLink, GridError> {
        let mut stream = self.open(peer)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.config.connect_timeout))?;
        stream.set_write_timeout(Some(self.config.connect_timeout))?;

        let mut link = if peer.secure() {
            let server_name = tls::server_name(peer.host())?;
            let mut conn = ClientConnection::new(Arc::clone(&self.tls), server_name)
                .map_err(|err| GridError::Protocol(err.to_string()))?;
            while conn.is_handshaking() {
                conn.complete_io(&mut stream)?;
            }
            LinkStream::ClientTls(Box::new(StreamOwned::new(conn, stream)))
        } else {
            LinkStream::Plain(stream)
        };
        write_hello(&mut link, &Hello::peer(self.config.local_name.clone()))?;
        Ok(PeerLink::new(link)?)
    }
}

impl PeerConnector for TcpPeerConnector {
    fn connect(&self, peer: &PeerDescriptor) -> Result<PeerLink, GridError> {
        debug!("connecting to peer {}", peer);
        self.establish(peer)
            .map_err(|err| GridError::discovery_connection(peer.to_string(), err))
    }
}
