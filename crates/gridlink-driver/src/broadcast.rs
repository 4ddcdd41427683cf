//! UDP broadcast discovery.
//!
//! Drivers announce themselves with one JSON datagram
//! (`{"instance":..,"name":..,"host":..,"port":..,"secure":..}`) on a shared
//! port and listen there for everyone else's announcements. Our own datagrams
//! are recognised by the per-process instance id, since names may repeat.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::str::FromStr;
use std::time::{Duration, Instant};

use gridlink_core::{GridError, PeerDescriptor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::discovery::{DiscoverySink, DriverDiscovery};

pub const DEFAULT_BROADCAST_PORT: u16 = 11111;
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Per-process id of the announcing driver.
    #[serde(default)]
    pub instance: String,
    pub name: String,
    /// Empty or unspecified means "use the datagram's source address".
    #[serde(default)]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

/// An address or `addr/prefix` network excluded from discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpExclusion {
    network: IpAddr,
    prefix: u8,
}

impl IpExclusion {
    pub fn matches(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for IpExclusion {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GridError::configuration(format!("invalid exclusion '{s}'"));
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let network: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self { network, prefix })
    }
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub bind_addr: SocketAddr,
    /// Where announcements go; the limited broadcast address on the bind
    /// port when `None`.
    pub announce_to: Option<SocketAddr>,
    pub interval: Duration,
    /// What this driver announces. Listen-only when `None`.
    pub announce: Option<Announcement>,
    pub exclude: Vec<IpExclusion>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_BROADCAST_PORT)),
            announce_to: None,
            interval: Duration::from_secs(5),
            announce: None,
            exclude: Vec::new(),
        }
    }
}

pub struct BroadcastDiscovery {
    socket: UdpSocket,
    config: BroadcastConfig,
    instance_id: String,
}

impl BroadcastDiscovery {
    /// Binds the UDP socket up front so port conflicts surface at startup.
    pub fn bind(config: BroadcastConfig, instance_id: impl Into<String>) -> Result<Self, GridError> {
        let socket = UdpSocket::bind(config.bind_addr)?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;
        Ok(Self {
            socket,
            config,
            instance_id: instance_id.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GridError> {
        Ok(self.socket.local_addr()?)
    }

    fn announce_target(&self) -> SocketAddr {
        self.config.announce_to.unwrap_or_else(|| {
            SocketAddr::from((Ipv4Addr::BROADCAST, self.config.bind_addr.port()))
        })
    }

    fn next_interval(&self) -> Duration {
        let jitter_ms = (self.config.interval.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return self.config.interval;
        }
        self.config.interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    fn announce(&self) {
        let Some(announcement) = &self.config.announce else {
            return;
        };
        match serde_json::to_vec(announcement) {
            Ok(bytes) => {
                if let Err(err) = self.socket.send_to(&bytes, self.announce_target()) {
                    warn!("broadcast announce to {} failed: {}", self.announce_target(), err);
                }
            }
            Err(err) => warn!("cannot encode announcement: {}", err),
        }
    }
}

impl DriverDiscovery for BroadcastDiscovery {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn discover(&mut self, sink: DiscoverySink) {
        let mut next_announce = Instant::now();
        let mut buf = vec![0_u8; MAX_DATAGRAM];
        while !sink.is_stopped() {
            if Instant::now() >= next_announce {
                self.announce();
                next_announce = Instant::now() + self.next_interval();
            }
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(err) => {
                    warn!("broadcast receive failed: {}", err);
                    if !sink.wait(Duration::from_millis(200)) {
                        return;
                    }
                    continue;
                }
            };
            if let Some(peer) =
                parse_announcement(&buf[..len], src, &self.instance_id, &self.config.exclude)
            {
                if !sink.new_connection(peer) {
                    return;
                }
            }
        }
    }
}

/// Turns a datagram into a peer, or `None` for our own, excluded, or
/// malformed announcements.
pub fn parse_announcement(
    bytes: &[u8],
    src: SocketAddr,
    instance_id: &str,
    exclude: &[IpExclusion],
) -> Option<PeerDescriptor> {
    let announcement: Announcement = match serde_json::from_slice(bytes) {
        Ok(a) => a,
        Err(err) => {
            debug!("ignoring malformed announcement from {}: {}", src, err);
            return None;
        }
    };
    if announcement.instance == instance_id || announcement.port == 0 {
        return None;
    }
    // `None` for a host name we cannot match against the exclusions.
    let ip = match announcement.host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => Some(src.ip()),
        Ok(ip) => Some(ip),
        Err(_) if announcement.host.is_empty() => Some(src.ip()),
        Err(_) => None,
    };
    if exclude
        .iter()
        .any(|rule| rule.matches(src.ip()) || ip.is_some_and(|ip| rule.matches(ip)))
    {
        debug!("announcement from {} excluded", src);
        return None;
    }
    let host = ip.map_or(announcement.host, |ip| ip.to_string());
    Some(PeerDescriptor::new(
        announcement.name,
        host,
        announcement.port,
        announcement.secure,
    ))
}
