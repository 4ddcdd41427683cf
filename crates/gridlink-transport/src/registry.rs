use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use gridlink_core::{ChannelId, ChannelRole, GridError, SelectionKey};
use serde::Serialize;
use tracing::debug;

/// Channel metadata handed to the registry by the networking layer.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub role: ChannelRole,
    pub secure: bool,
    pub local_port: u16,
    pub remote_addr: SocketAddr,
    pub name: Option<String>,
    pub selection_key: SelectionKey,
}

/// Point-in-time view of one open channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub role: ChannelRole,
    pub secure: bool,
    pub local_port: u16,
    pub remote_addr: SocketAddr,
    /// Peer driver name or node name announced in the hello frame.
    pub name: Option<String>,
    pub selection_key: SelectionKey,
}

impl ChannelInfo {
    pub fn is_peer(&self) -> bool {
        self.role == ChannelRole::Peer
    }
}

/// Notified after every registry mutation, outside the registry lock.
pub trait ChannelObserver: Send + Sync {
    fn on_registered(&self, _registry: &ChannelRegistry, _channel: &ChannelInfo) {}
    fn on_deregistered(&self, _registry: &ChannelRegistry, _channel: &ChannelInfo) {}
}

/// Authoritative set of open channels.
///
/// Readers get whole `ChannelInfo` copies or `NotFound`; a concurrent
/// disconnect never yields partial data.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<BTreeMap<ChannelId, ChannelInfo>>,
    next_id: AtomicU64,
    observers: RwLock<Vec<Arc<dyn ChannelObserver>>>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.read().len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: Arc<dyn ChannelObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Records a freshly accepted or established channel.
    pub fn register(&self, channel: NewChannel) -> ChannelId {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let info = ChannelInfo {
            id,
            role: channel.role,
            secure: channel.secure,
            local_port: channel.local_port,
            remote_addr: channel.remote_addr,
            name: channel.name,
            selection_key: channel.selection_key,
        };
        self.write().insert(id, info.clone());
        debug!(
            "registered {} channel {} to {} (secure={})",
            info.role, id, info.remote_addr, info.secure
        );
        for observer in self.observers() {
            observer.on_registered(self, &info);
        }
        id
    }

    /// Removes a channel after disconnect. Stale ids yield `NotFound`.
    pub fn deregister(&self, id: ChannelId) -> Result<ChannelInfo, GridError> {
        let info = self.write().remove(&id).ok_or_else(|| stale(id))?;
        debug!("deregistered {} channel {}", info.role, id);
        for observer in self.observers() {
            observer.on_deregistered(self, &info);
        }
        Ok(info)
    }

    /// Snapshot of all open channels, ordered by id.
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        self.read().values().cloned().collect()
    }

    pub fn peer_channels(&self) -> Vec<ChannelInfo> {
        self.read()
            .values()
            .filter(|c| c.is_peer())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: ChannelId) -> Result<ChannelInfo, GridError> {
        self.read().get(&id).cloned().ok_or_else(|| stale(id))
    }

    pub fn is_peer(&self, id: ChannelId) -> Result<bool, GridError> {
        self.with_channel(id, ChannelInfo::is_peer)
    }

    pub fn is_secure(&self, id: ChannelId) -> Result<bool, GridError> {
        self.with_channel(id, |c| c.secure)
    }

    pub fn local_port(&self, id: ChannelId) -> Result<u16, GridError> {
        self.with_channel(id, |c| c.local_port)
    }

    pub fn count(&self, role: ChannelRole) -> usize {
        self.read().values().filter(|c| c.role == role).count()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn with_channel<T>(&self, id: ChannelId, f: impl FnOnce(&ChannelInfo) -> T) -> Result<T, GridError> {
        self.read().get(&id).map(f).ok_or_else(|| stale(id))
    }

    fn observers(&self) -> Vec<Arc<dyn ChannelObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // Every write is a single insert/remove, so a poisoned map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ChannelId, ChannelInfo>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ChannelId, ChannelInfo>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn stale(id: ChannelId) -> GridError {
    GridError::not_found(format!("channel {id}"))
}
