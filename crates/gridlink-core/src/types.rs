use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GridError;

/// Registry-assigned channel identifier. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque readiness token owned by the networking layer.
///
/// Kept on channels for introspection only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionKey(pub u64);

/// What sits at the far end of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    /// Another driver, connected for federation.
    Peer,
    /// A worker node executing dispatched work.
    Node,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Peer => f.write_str("peer"),
            ChannelRole::Node => f.write_str("node"),
        }
    }
}

/// A discovered remote driver.
///
/// Immutable once built. Identity is `(host, port, secure)`; the logical
/// name is informational and does not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescriptor {
    host: String,
    port: u16,
    name: String,
    secure: bool,
}

impl PeerDescriptor {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            name: name.into(),
            secure,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.secure == other.secure
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.secure.hash(state);
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address())?;
        if self.secure {
            f.write_str("#secure")?;
        }
        Ok(())
    }
}

/// Parses `[name@]host:port[#secure]`.
///
/// Without a name, the address itself is used as the name.
impl FromStr for PeerDescriptor {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let (raw, secure) = match raw.strip_suffix("#secure") {
            Some(rest) => (rest, true),
            None => (raw, false),
        };
        let (name, address) = match raw.split_once('@') {
            Some((name, address)) => (name.trim(), address.trim()),
            None => ("", raw),
        };
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| GridError::configuration(format!("peer '{s}': expected host:port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(GridError::configuration(format!("peer '{s}': empty host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| GridError::configuration(format!("peer '{s}': invalid port")))?;
        let name = if name.is_empty() { address } else { name };
        Ok(Self::new(name, host, port, secure))
    }
}
