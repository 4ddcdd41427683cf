//! Channel bookkeeping and connection plumbing for gridlink drivers.
//!
//! The registry is the only shared state; connectors and the listener feed
//! it as links come and go.

pub mod connector;
pub mod hello;
pub mod link;
pub mod listener;
pub mod registry;
pub mod tls;

pub use connector::{ConnectorConfig, PeerConnector, TcpPeerConnector};
pub use hello::Hello;
pub use link::{LinkCloser, LinkEnd, LinkStream, PeerLink};
pub use listener::{ChannelListener, ListenerConfig, ListenerMetrics};
pub use registry::{ChannelInfo, ChannelObserver, ChannelRegistry, NewChannel};
pub use tls::{TlsError, TlsIdentity, TlsTrust};
