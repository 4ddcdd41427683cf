use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gridlink_core::{ChannelRole, GridError, PeerDescriptor};
use gridlink_transport::{
    ChannelListener, ChannelRegistry, ConnectorConfig, LinkEnd, ListenerConfig, PeerConnector,
    TcpPeerConnector, TlsIdentity, TlsTrust,
};

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn listen(registry: &Arc<ChannelRegistry>, identity: Option<TlsIdentity>) -> ChannelListener {
    ChannelListener::bind(
        ListenerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            identity,
            hello_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(20),
        },
        Arc::clone(registry),
    )
    .expect("bind listener")
}

fn connector(trust: TlsTrust) -> TcpPeerConnector {
    TcpPeerConnector::new(ConnectorConfig {
        local_name: "driver-a".to_string(),
        connect_timeout: Duration::from_secs(2),
        tls_trust: trust,
    })
    .expect("connector")
}

#[test]
fn plain_peer_link_registers_on_the_accepting_side() {
    let registry = Arc::new(ChannelRegistry::new());
    let listener = listen(&registry, None);
    let port = listener.local_addr().port();

    let link = connector(TlsTrust::Insecure)
        .connect(&PeerDescriptor::new("driver-b", "127.0.0.1", port, false))
        .expect("connect");

    assert!(wait_until(|| registry.count(ChannelRole::Peer) == 1));
    let channel = registry.peer_channels().remove(0);
    assert_eq!(channel.name.as_deref(), Some("driver-a"));
    assert_eq!(channel.remote_addr, link.local_addr);
    assert!(!channel.secure);

    drop(link);
    assert!(wait_until(|| registry.is_empty()));
}

#[test]
fn pinned_tls_link_is_secure_on_both_ends() {
    let identity = TlsIdentity::generate_self_signed("localhost").expect("identity");
    let registry = Arc::new(ChannelRegistry::new());
    let listener = listen(&registry, Some(identity.clone()));
    assert!(listener.is_secure());

    let mut link = connector(TlsTrust::Pinned(vec![identity.cert_der]))
        .connect(&PeerDescriptor::new(
            "driver-b",
            "127.0.0.1",
            listener.local_addr().port(),
            true,
        ))
        .expect("tls connect");
    assert!(link.secure());
    assert!(link.new_channel(ChannelRole::Peer, None).secure);

    assert!(wait_until(|| registry.count(ChannelRole::Peer) == 1));
    assert!(registry.peer_channels()[0].secure);

    drop(listener);
    assert!(registry.is_empty());
    let running = AtomicBool::new(true);
    assert_ne!(
        link.monitor(&running, Duration::from_millis(20)),
        LinkEnd::Stopped
    );
}

#[test]
fn unpinned_certificate_is_refused() {
    let served = TlsIdentity::generate_self_signed("localhost").expect("identity");
    let other = TlsIdentity::generate_self_signed("localhost").expect("identity");
    let registry = Arc::new(ChannelRegistry::new());
    let listener = listen(&registry, Some(served));

    let result = connector(TlsTrust::Pinned(vec![other.cert_der])).connect(&PeerDescriptor::new(
        "driver-b",
        "127.0.0.1",
        listener.local_addr().port(),
        true,
    ));
    assert!(matches!(result, Err(GridError::DiscoveryConnection { .. })));
    assert!(wait_until(|| listener.metrics_snapshot().hello_failures == 1));
    assert!(registry.is_empty());
}

#[test]
fn many_concurrent_nodes_all_register() {
    use gridlink_transport::hello::{write_hello, Hello};
    use std::net::TcpStream;

    const NODES: usize = 530;
    let registry = Arc::new(ChannelRegistry::new());
    let listener = listen(&registry, None);

    let nodes: Vec<TcpStream> = (0..NODES)
        .map(|i| {
            let mut stream = TcpStream::connect(listener.local_addr()).expect("connect");
            write_hello(&mut stream, &Hello::node(format!("node-{i}"))).expect("hello");
            stream
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(20);
    while registry.count(ChannelRole::Node) < NODES && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(registry.count(ChannelRole::Node), NODES);
    assert_eq!(listener.metrics_snapshot().hello_failures, 0);

    drop(nodes);
    assert!(wait_until(|| registry.is_empty()));
}
