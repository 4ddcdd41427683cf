//! An established link, plain or TLS, and its liveness monitor.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use gridlink_core::{ChannelRole, SelectionKey};
use rustls::{ClientConnection, ServerConnection, StreamOwned};
use tracing::trace;

use crate::registry::NewChannel;

static NEXT_SELECTION_KEY: AtomicU64 = AtomicU64::new(1);

pub enum LinkStream {
    Plain(TcpStream),
    ClientTls(Box<StreamOwned<ClientConnection, TcpStream>>),
    ServerTls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl LinkStream {
    pub fn tcp(&self) -> &TcpStream {
        match self {
            LinkStream::Plain(stream) => stream,
            LinkStream::ClientTls(tls) => &tls.sock,
            LinkStream::ServerTls(tls) => &tls.sock,
        }
    }

    pub fn is_secure(&self) -> bool {
        !matches!(self, LinkStream::Plain(_))
    }

    /// A handle that can tear the socket down from another thread.
    pub fn closer(&self) -> io::Result<LinkCloser> {
        Ok(LinkCloser(self.tcp().try_clone()?))
    }
}

impl Read for LinkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            LinkStream::Plain(stream) => stream.read(buf),
            LinkStream::ClientTls(tls) => tls.read(buf),
            LinkStream::ServerTls(tls) => tls.read(buf),
        }
    }
}

impl Write for LinkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LinkStream::Plain(stream) => stream.write(buf),
            LinkStream::ClientTls(tls) => tls.write(buf),
            LinkStream::ServerTls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LinkStream::Plain(stream) => stream.flush(),
            LinkStream::ClientTls(tls) => tls.flush(),
            LinkStream::ServerTls(tls) => tls.flush(),
        }
    }
}

#[derive(Debug)]
pub struct LinkCloser(TcpStream);

impl LinkCloser {
    pub fn close(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

/// Why a monitored link stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEnd {
    /// Remote closed the connection.
    Eof,
    Failed(io::ErrorKind),
    /// The local side asked to stop.
    Stopped,
}

pub struct PeerLink {
    pub stream: LinkStream,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

impl PeerLink {
    pub fn new(stream: LinkStream) -> io::Result<Self> {
        let local_addr = stream.tcp().local_addr()?;
        let remote_addr = stream.tcp().peer_addr()?;
        Ok(Self {
            stream,
            local_addr,
            remote_addr,
        })
    }

    pub fn secure(&self) -> bool {
        self.stream.is_secure()
    }

    pub fn new_channel(&self, role: ChannelRole, name: Option<String>) -> NewChannel {
        NewChannel {
            role,
            secure: self.secure(),
            local_port: self.local_addr.port(),
            remote_addr: self.remote_addr,
            name,
            selection_key: SelectionKey(NEXT_SELECTION_KEY.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Reads and discards inbound bytes until the link ends or `running` clears.
    ///
    /// `poll` bounds how long a stop request can go unnoticed.
    pub fn monitor(&mut self, running: &AtomicBool, poll: Duration) -> LinkEnd {
        if let Err(err) = self.stream.tcp().set_read_timeout(Some(poll)) {
            return LinkEnd::Failed(err.kind());
        }
        let mut buf = [0_u8; 1024];
        while running.load(Ordering::Relaxed) {
            match self.stream.read(&mut buf) {
                Ok(0) => return LinkEnd::Eof,
                Ok(n) => trace!("discarding {} bytes from {}", n, self.remote_addr),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => return LinkEnd::Failed(err.kind()),
            }
        }
        LinkEnd::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    #[test]
    fn channel_metadata_comes_from_the_socket() {
        let (client, server) = pair();
        let link = PeerLink::new(LinkStream::Plain(client)).expect("link");
        let channel = link.new_channel(ChannelRole::Peer, Some("b".into()));
        assert!(!channel.secure);
        assert_eq!(channel.local_port, link.local_addr.port());
        assert_eq!(channel.remote_addr, server.local_addr().expect("server addr"));

        let other = link.new_channel(ChannelRole::Peer, None);
        assert_ne!(channel.selection_key, other.selection_key);
    }

    #[test]
    fn monitor_reports_remote_close() {
        let (client, mut server) = pair();
        let mut link = PeerLink::new(LinkStream::Plain(client)).expect("link");
        server.write_all(b"ignored").expect("write");
        drop(server);
        let running = AtomicBool::new(true);
        assert_eq!(link.monitor(&running, Duration::from_millis(20)), LinkEnd::Eof);
    }

    #[test]
    fn monitor_stops_when_flag_clears() {
        let (client, _server) = pair();
        let mut link = PeerLink::new(LinkStream::Plain(client)).expect("link");
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flag.store(false, Ordering::Relaxed);
        });
        assert_eq!(link.monitor(&running, Duration::from_millis(10)), LinkEnd::Stopped);
        stopper.join().expect("stopper thread");
    }

    #[test]
    fn closer_ends_a_blocked_monitor() {
        let (client, _server) = pair();
        let mut link = PeerLink::new(LinkStream::Plain(client)).expect("link");
        let closer = link.stream.closer().expect("closer");
        let running = AtomicBool::new(true);
        let monitor = thread::spawn(move || link.monitor(&running, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        closer.close();
        let end = monitor.join().expect("monitor thread");
        assert_ne!(end, LinkEnd::Stopped);
    }
}
