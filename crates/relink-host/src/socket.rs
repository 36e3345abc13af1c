//! UDP transport, a lossy test wrapper and the high-level [`Host`].

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket},
    sync::Arc,
    thread::{sleep, yield_now},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, TryRecvError};
use rand::{rngs::StdRng, Rng, SeedableRng};
use relink_core::{config::Config, error::Result, transport::Socket};
use relink_peer::PeerEvent;
use relink_protocol::ack::NotifyToken;
use socket2::Socket as Socket2;
use tracing::trace;

use crate::{
    peer::Peer,
    time::{Clock, SystemClock},
};

/// Applies OS-level socket options from the configuration.
fn apply_socket_options(socket: &UdpSocket, config: &Config) -> io::Result<()> {
    let socket2 = Socket2::from(socket.try_clone()?);
    if let Some(size) = config.socket_recv_buffer_size {
        socket2.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        socket2.set_send_buffer_size(size)?;
    }
    Ok(())
}

/// Non-blocking UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds a non-blocking UDP socket with the configured options.
    pub fn bind<A: ToSocketAddrs>(addresses: A, config: &Config) -> Result<Self> {
        let socket = UdpSocket::bind(addresses)?;
        apply_socket_options(&socket, config)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl Socket for UdpTransport {
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> io::Result<usize> {
        self.socket.send_to(payload, addr)
    }

    fn receive_packet<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<(&'a [u8], SocketAddr)> {
        self.socket.recv_from(buffer).map(move |(len, address)| (&buffer[..len], address))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// High-level host: a peer over a UDP socket plus a clock.
///
/// Applications either call [`manual_poll`](Host::manual_poll) from their
/// own loop or hand the thread over with
/// [`start_polling`](Host::start_polling) and consume events from
/// [`event_receiver`](Host::event_receiver).
pub struct Host {
    peer: Peer<UdpTransport>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").field("peer", &self.peer).finish()
    }
}

impl Host {
    /// Creates a host bound to the given address with default
    /// configuration.
    pub fn bind<A: ToSocketAddrs>(addresses: A) -> Result<Self> {
        Self::bind_with_config(addresses, Config::default())
    }

    /// Creates a host bound to any free port on localhost with default
    /// configuration.
    pub fn bind_any() -> Result<Self> {
        Self::bind_any_with_config(Config::default())
    }

    /// Creates a host bound to any free port on localhost.
    pub fn bind_any_with_config(config: Config) -> Result<Self> {
        let loopback = Ipv4Addr::new(127, 0, 0, 1);
        Self::bind_with_config(SocketAddrV4::new(loopback, 0), config)
    }

    /// Creates a host bound to the given address.
    pub fn bind_with_config<A: ToSocketAddrs>(addresses: A, config: Config) -> Result<Self> {
        Self::bind_with_config_and_clock(addresses, config, Arc::new(SystemClock))
    }

    /// Creates a host with a custom clock, for tests that control time.
    pub fn bind_with_config_and_clock<A: ToSocketAddrs>(
        addresses: A,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let transport = UdpTransport::bind(addresses, &config)?;
        Ok(Host { peer: Peer::new(transport, config)?, clock })
    }

    /// Channel of lifecycle and data events, clonable for consumer
    /// threads.
    pub fn event_receiver(&self) -> Receiver<PeerEvent> {
        self.peer.event_receiver().clone()
    }

    /// Next pending event, if any.
    pub fn recv(&mut self) -> Option<PeerEvent> {
        match self.peer.event_receiver().try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            // the peer holds the sender, so this arm is unreachable
            Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Starts the handshake towards `addr`.
    pub fn connect(&mut self, addr: SocketAddr) {
        self.peer.connect(addr, self.clock.now());
    }

    /// Starts a graceful teardown of the connection to `addr`.
    pub fn disconnect(&mut self, addr: SocketAddr) -> Result<()> {
        self.peer.disconnect(addr, self.clock.now())
    }

    /// Sends an untracked payload to `addr`.
    pub fn send_unreliable(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        self.peer.send_unreliable(addr, payload)
    }

    /// Sends a message to `addr` with exactly-once, in-order delivery.
    pub fn send_reliable(&mut self, addr: SocketAddr, message: &[u8]) -> Result<()> {
        self.peer.send_reliable(addr, message, self.clock.now())
    }

    /// Sends a fire-and-forget payload to `addr` whose delivery fate is
    /// reported through the returned token.
    pub fn send_notify(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<NotifyToken> {
        self.peer.send_notify(addr, payload, self.clock.now())
    }

    /// Sends a reliable message to every established connection.
    /// Returns how many connections it went to.
    pub fn broadcast_reliable(&mut self, message: &[u8]) -> Result<usize> {
        let addrs = self.peer.connected_addrs();
        let now = self.clock.now();
        for addr in &addrs {
            self.peer.send_reliable(*addr, message, now)?;
        }
        Ok(addrs.len())
    }

    /// Sends an untracked payload to every established connection.
    /// Returns how many connections it went to.
    pub fn broadcast_unreliable(&mut self, payload: &[u8]) -> Result<usize> {
        let addrs = self.peer.connected_addrs();
        for addr in &addrs {
            self.peer.send_unreliable(*addr, payload)?;
        }
        Ok(addrs.len())
    }

    /// Polls in a loop with 1ms sleeps. Blocks the calling thread.
    pub fn start_polling(&mut self) {
        self.start_polling_with_duration(Some(Duration::from_millis(1)))
    }

    /// Polls in a loop with a custom sleep between ticks. Blocks the
    /// calling thread.
    pub fn start_polling_with_duration(&mut self, sleep_duration: Option<Duration>) {
        loop {
            self.manual_poll(self.clock.now());
            match sleep_duration {
                None => yield_now(),
                Some(duration) => sleep(duration),
            };
        }
    }

    /// One tick of the peer: socket I/O, timers, flush, eviction.
    pub fn manual_poll(&mut self, time: Instant) {
        self.peer.poll(time);
    }

    /// Local address this host is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.peer.local_addr()
    }

    /// Number of fully established connections.
    pub fn connected_count(&self) -> usize {
        self.peer.connected_count()
    }
}

/// Wraps a socket and drops a fraction of its traffic, for exercising
/// retransmission under loss without a real bad network.
#[derive(Debug)]
pub struct LinkConditioner<T: Socket> {
    socket: T,
    incoming_loss: f64,
    outgoing_loss: f64,
    rng: StdRng,
}

impl<T: Socket> LinkConditioner<T> {
    /// Wraps `socket`, dropping each datagram with the given independent
    /// probabilities. `seed` makes a run reproducible.
    pub fn new(socket: T, incoming_loss: f64, outgoing_loss: f64, seed: u64) -> Self {
        Self { socket, incoming_loss, outgoing_loss, rng: StdRng::seed_from_u64(seed) }
    }
}

impl<T: Socket> Socket for LinkConditioner<T> {
    fn send_packet(&mut self, addr: &SocketAddr, payload: &[u8]) -> io::Result<usize> {
        if self.rng.gen_bool(self.outgoing_loss) {
            trace!(%addr, "conditioner dropped outgoing datagram");
            return Ok(payload.len());
        }
        self.socket.send_packet(addr, payload)
    }

    fn receive_packet<'a>(&mut self, buffer: &'a mut [u8]) -> io::Result<(&'a [u8], SocketAddr)> {
        loop {
            let (len, address) = {
                let (payload, address) = self.socket.receive_packet(&mut *buffer)?;
                (payload.len(), address)
            };
            if self.rng.gen_bool(self.incoming_loss) {
                trace!(%address, "conditioner dropped incoming datagram");
                continue;
            }
            return Ok((&buffer[..len], address));
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relink_protocol::packet::DisconnectReason;

    #[test]
    fn test_bind_any_reports_local_addr() {
        let host = Host::bind_any().unwrap();
        let addr = host.local_addr().unwrap();
        assert!(addr.port() != 0);
    }

    #[test]
    fn test_socket_options_applied() {
        let config = Config {
            socket_recv_buffer_size: Some(131072),
            socket_send_buffer_size: Some(65536),
            ..Config::default()
        };
        assert!(Host::bind_any_with_config(config).is_ok());
    }

    /// Drives both hosts until `done` or the budget runs out.
    fn pump(a: &mut Host, b: &mut Host, mut done: impl FnMut(&mut Host, &mut Host) -> bool) {
        let start = Instant::now();
        for tick in 0..500u64 {
            let now = start + Duration::from_millis(tick * 10);
            a.manual_poll(now);
            b.manual_poll(now);
            if done(a, b) {
                return;
            }
            sleep(Duration::from_millis(1));
        }
        panic!("hosts did not converge");
    }

    #[test]
    fn test_loopback_handshake_and_reliable_payload() {
        let mut server = Host::bind_any().unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut client = Host::bind_any().unwrap();

        client.connect(server_addr);
        pump(&mut client, &mut server, |c, s| {
            c.connected_count() == 1 && s.connected_count() == 1
        });

        assert!(matches!(client.recv(), Some(PeerEvent::Connected { .. })));
        assert!(matches!(server.recv(), Some(PeerEvent::Connected { .. })));

        client.send_reliable(server_addr, b"hello").unwrap();
        let mut payload = None;
        pump(&mut client, &mut server, |_, s| {
            if let Some(PeerEvent::Data { payload: p, .. }) = s.recv() {
                payload = Some(p);
                true
            } else {
                false
            }
        });
        assert_eq!(payload.unwrap(), b"hello");
    }

    #[test]
    fn test_loopback_graceful_disconnect() {
        let mut server = Host::bind_any().unwrap();
        let server_addr = server.local_addr().unwrap();
        let mut client = Host::bind_any().unwrap();

        client.connect(server_addr);
        pump(&mut client, &mut server, |c, s| {
            c.connected_count() == 1 && s.connected_count() == 1
        });
        let _ = client.recv();
        let _ = server.recv();

        client.disconnect(server_addr).unwrap();
        let mut reason = None;
        pump(&mut client, &mut server, |_, s| {
            if let Some(PeerEvent::Disconnected { reason: r, .. }) = s.recv() {
                reason = Some(r);
                true
            } else {
                false
            }
        });
        assert_eq!(reason, Some(DisconnectReason::RequestedByRemotePeer));
    }

    #[test]
    fn test_conditioned_link_still_delivers_reliable() {
        let config = Config::default();
        let server_transport =
            UdpTransport::bind(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 0), &config).unwrap();
        let conditioned = LinkConditioner::new(server_transport, 0.25, 0.25, 7);
        let mut server = Peer::new(conditioned, config.clone()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut client = Host::bind_any_with_config(config).unwrap();
        client.connect(server_addr);

        let start = Instant::now();
        let mut delivered = false;
        let mut sent = false;
        for tick in 0..2000u64 {
            let now = start + Duration::from_millis(tick * 10);
            client.manual_poll(now);
            server.poll(now);
            if !sent && client.connected_count() == 1 {
                client.send_reliable(server_addr, b"through the noise").unwrap();
                sent = true;
            }
            while let Ok(event) = server.event_receiver().try_recv() {
                if let PeerEvent::Data { payload, .. } = event {
                    assert_eq!(payload, b"through the noise");
                    delivered = true;
                }
            }
            if delivered {
                break;
            }
            sleep(Duration::from_millis(1));
        }
        assert!(delivered, "reliable message never made it through the lossy link");
    }
}
