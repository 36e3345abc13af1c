//! The peer: one socket, many connections.

use std::{collections::HashMap, net::SocketAddr, time::Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use relink_core::{
    config::Config,
    error::{ErrorKind, Result},
    transport::Socket,
};
use relink_peer::{Connection, PeerEvent};
use relink_protocol::{
    ack::NotifyToken,
    packet::{Command, PacketType, RejectReason},
};
use tracing::{debug, error, trace};

/// Demultiplexes one datagram socket across a table of connections.
///
/// The peer owns the socket; connections never touch it. Each call to
/// [`poll`](Peer::poll) drains the socket, routes datagrams to their
/// connection, drives every connection's timers, flushes queued outgoing
/// datagrams and evicts connections that have ended.
pub struct Peer<T: Socket> {
    socket: T,
    config: Config,
    connections: HashMap<SocketAddr, Connection>,
    receive_buffer: Vec<u8>,
    event_sender: Sender<PeerEvent>,
    event_receiver: Receiver<PeerEvent>,
}

impl<T: Socket> Peer<T> {
    /// Creates a peer over `socket`. Fails when the configuration is
    /// inconsistent.
    pub fn new(socket: T, config: Config) -> Result<Self> {
        config.validate()?;
        let (event_sender, event_receiver) = unbounded();
        Ok(Self {
            receive_buffer: vec![0; config.mtu],
            socket,
            config,
            connections: HashMap::new(),
            event_sender,
            event_receiver,
        })
    }

    /// Channel carrying lifecycle and data events for the application.
    pub fn event_receiver(&self) -> &Receiver<PeerEvent> {
        &self.event_receiver
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of connections in the table, in any state.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of fully established connections.
    pub fn connected_count(&self) -> usize {
        self.connections.values().filter(|c| c.state().is_connected()).count()
    }

    /// Addresses of all established connections.
    pub fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.connections
            .iter()
            .filter(|(_, c)| c.state().is_connected())
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Starts the handshake towards `addr`. The first connect request
    /// goes out on the next poll. Calling this for an address that
    /// already has a live connection is a no-op.
    pub fn connect(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(existing) = self.connections.get(&addr) {
            if !existing.state().is_ended() {
                trace!(%addr, "connect ignored, connection already live");
                return;
            }
        }
        let mut connection = Connection::new(addr, &self.config, self.event_sender.clone(), now);
        connection.connect();
        self.connections.insert(addr, connection);
    }

    /// Starts a graceful teardown of the connection to `addr`.
    pub fn disconnect(&mut self, addr: SocketAddr, now: Instant) -> Result<()> {
        let connection = self
            .connections
            .get_mut(&addr)
            .ok_or(ErrorKind::UnknownConnection)?;
        connection.disconnect(now);
        Ok(())
    }

    /// Sends an untracked payload to `addr`.
    pub fn send_unreliable(&mut self, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        self.connection_mut(addr)?.send_unreliable(payload)
    }

    /// Sends a message to `addr` with exactly-once, in-order delivery.
    pub fn send_reliable(&mut self, addr: SocketAddr, message: &[u8], now: Instant) -> Result<()> {
        self.connection_mut(addr)?.send_reliable(message, now)
    }

    /// Sends a fire-and-forget payload to `addr`; the returned token
    /// reports whether it was delivered or lost.
    pub fn send_notify(
        &mut self,
        addr: SocketAddr,
        payload: &[u8],
        now: Instant,
    ) -> Result<NotifyToken> {
        self.connection_mut(addr)?.send_notify(payload, now)
    }

    fn connection_mut(&mut self, addr: SocketAddr) -> Result<&mut Connection> {
        self.connections.get_mut(&addr).ok_or(ErrorKind::UnknownConnection)
    }

    /// One tick: drain the socket, drive timers, flush sends, evict
    /// ended connections.
    pub fn poll(&mut self, now: Instant) {
        self.receive(now);
        for connection in self.connections.values_mut() {
            connection.update(now);
        }
        self.flush(now);
        self.sweep();
    }

    fn receive(&mut self, now: Instant) {
        loop {
            match self.socket.receive_packet(self.receive_buffer.as_mut()) {
                Ok((payload, address)) => {
                    if let Some(connection) = self.connections.get_mut(&address) {
                        if let Err(e) = connection.handle_packet(payload, now) {
                            debug!(addr = %address, error = %e, "dropped malformed datagram");
                        }
                    } else {
                        let payload = payload.to_vec();
                        self.handle_unconnected(address, &payload, now);
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        error!("error receiving data: {:?}", e);
                    }
                    break;
                }
            }
        }
    }

    /// Admission control: only a valid connect request from an unknown
    /// address creates a connection. Anything else is dropped so stray
    /// datagrams cannot allocate state.
    fn handle_unconnected(&mut self, addr: SocketAddr, data: &[u8], now: Instant) {
        let is_connect_request = data.len() >= 2
            && data[0] == PacketType::Command as u8
            && data[1] == Command::ConnectRequest as u8;
        if !is_connect_request {
            trace!(%addr, "datagram from unknown address dropped");
            return;
        }

        if self.config.key.is_some() && &data[2..] != self.config.key_bytes() {
            debug!(%addr, "connect request with wrong key rejected");
            self.send_reject(addr, RejectReason::KeyInvalid);
            return;
        }

        let live = self.connections.values().filter(|c| !c.state().is_ended()).count();
        if live >= self.config.max_connections {
            debug!(%addr, "connect request rejected, peer full");
            self.send_reject(addr, RejectReason::ServerFull);
            return;
        }

        let mut connection = Connection::new(addr, &self.config, self.event_sender.clone(), now);
        connection.accept();
        self.connections.insert(addr, connection);
    }

    /// Rejections are sent without allocating a connection.
    fn send_reject(&mut self, addr: SocketAddr, reason: RejectReason) {
        let packet = [
            PacketType::Command as u8,
            Command::ConnectionRejected as u8,
            reason as u8,
        ];
        if let Err(e) = self.socket.send_packet(&addr, &packet) {
            error!(%addr, "error sending rejection: {:?}", e);
        }
    }

    fn flush(&mut self, now: Instant) {
        for (addr, connection) in self.connections.iter_mut() {
            let mut sent_any = false;
            while let Some(datagram) = connection.pop_outgoing() {
                if let Err(e) = self.socket.send_packet(addr, &datagram) {
                    error!(%addr, "error sending a packet: {:?}", e);
                    break;
                }
                sent_any = true;
            }
            if sent_any {
                connection.set_send_time(now);
            }
        }
    }

    fn sweep(&mut self) {
        self.connections.retain(|addr, connection| {
            if connection.should_remove() {
                debug!(%addr, "connection removed");
                connection.mark_destroyed();
                false
            } else {
                true
            }
        });
    }
}

impl<T: Socket> std::fmt::Debug for Peer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("connections", &self.connections.len())
            .finish()
    }
}
