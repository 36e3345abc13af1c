//! The per-endpoint connection state machine.

use std::{collections::VecDeque, fmt, net::SocketAddr, time::Instant};

use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::Sender;
use relink_core::{
    config::Config,
    error::{ErrorKind, Result},
};
use relink_protocol::{
    ack::{AckSystem, NotifyToken, ReliableReceived},
    packet::{
        Command, DisconnectReason, PacketType, RejectReason, COMMAND_HEADER_SIZE,
        RELIABLE_MESSAGE_LENGTH_SIZE,
    },
};
use tracing::{debug, trace, warn};

use crate::{
    connection_state::ConnectionState,
    event::PeerEvent,
    trackers::{ConnectingTracker, DisconnectedTracker, KeepAliveTracker, TimeoutTracker},
};

/// One remote endpoint: lifecycle state, timers and reliability engine.
///
/// A connection never touches the socket. Incoming datagrams are handed in
/// by the owning peer through [`handle_packet`](Connection::handle_packet);
/// outgoing datagrams are queued and drained through
/// [`pop_outgoing`](Connection::pop_outgoing).
pub struct Connection {
    addr: SocketAddr,
    state: ConnectionState,

    connecting: ConnectingTracker,
    timeout: TimeoutTracker,
    keep_alive: KeepAliveTracker,
    disconnected: DisconnectedTracker,

    ack: AckSystem,
    events: Sender<PeerEvent>,
    out: VecDeque<Vec<u8>>,

    key: Vec<u8>,
    mtu: usize,
    /// Set when the connection failed before establishing and should be
    /// evicted without a grace window.
    remove_now: bool,
}

impl Connection {
    /// Creates a connection in `Created` state for `addr`.
    pub fn new(addr: SocketAddr, config: &Config, events: Sender<PeerEvent>, now: Instant) -> Self {
        Self {
            addr,
            state: ConnectionState::Created,
            connecting: ConnectingTracker::new(
                config.connect_attempt_interval,
                config.max_connect_attempts,
            ),
            timeout: TimeoutTracker::new(config.timeout_duration, now),
            keep_alive: KeepAliveTracker::new(config.keep_alive_interval, now),
            disconnected: DisconnectedTracker::new(config.disconnect_duration),
            ack: AckSystem::new(config, now),
            events,
            out: VecDeque::new(),
            key: config.key_bytes().to_vec(),
            mtu: config.mtu,
            remove_now: false,
        }
    }

    /// Remote endpoint of this connection.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, new: ConnectionState) {
        match new {
            ConnectionState::Connecting => {
                debug_assert_eq!(self.state, ConnectionState::Created)
            }
            ConnectionState::Connected => debug_assert!(matches!(
                self.state,
                ConnectionState::Created | ConnectionState::Connecting
            )),
            ConnectionState::Disconnected => {
                debug_assert_eq!(self.state, ConnectionState::Connected)
            }
            ConnectionState::Destroyed => {
                debug_assert_eq!(self.state, ConnectionState::Removing)
            }
            _ => {}
        }
        debug!(addr = %self.addr, from = ?self.state, to = ?new, "connection state change");
        self.state = new;
    }

    // --- lifecycle -------------------------------------------------------

    /// Starts the client side of the handshake. The first connect request
    /// goes out on the next update.
    pub fn connect(&mut self) {
        self.set_state(ConnectionState::Connecting);
    }

    /// Accepts an inbound connect request (server side): establishes the
    /// connection and answers with `ConnectionAccepted`.
    pub fn accept(&mut self) {
        self.queue_command(Command::ConnectionAccepted, &[]);
        self.set_state(ConnectionState::Connected);
        let _ = self.events.send(PeerEvent::Connected { addr: self.addr });
    }

    /// Starts a locally requested teardown.
    pub fn disconnect(&mut self, now: Instant) {
        self.internal_disconnect(DisconnectReason::RequestedByLocalPeer, true, now);
    }

    fn internal_disconnect(&mut self, reason: DisconnectReason, send_to_other: bool, now: Instant) {
        match self.state {
            ConnectionState::Connecting => {
                self.failed_to_connect(RejectReason::ClosedByPeer);
            }
            ConnectionState::Connected => {
                if send_to_other {
                    self.queue_command(Command::Disconnect, &[reason as u8]);
                }
                self.set_state(ConnectionState::Disconnected);
                self.disconnected.on_disconnect(now);
                let _ = self
                    .events
                    .send(PeerEvent::Disconnected { addr: self.addr, reason });
            }
            _ => {}
        }
    }

    fn failed_to_connect(&mut self, reason: RejectReason) {
        debug!(addr = %self.addr, ?reason, "connect attempt failed");
        self.set_state(ConnectionState::Removing);
        self.remove_now = true;
        let _ = self
            .events
            .send(PeerEvent::ConnectionFailed { addr: self.addr, reason });
    }

    /// Whether the peer should evict this connection from its table.
    pub fn should_remove(&self) -> bool {
        self.remove_now || self.state == ConnectionState::Removing
    }

    /// Marks the connection destroyed right before eviction.
    pub fn mark_destroyed(&mut self) {
        self.set_state(ConnectionState::Destroyed);
    }

    // --- sending ---------------------------------------------------------

    /// Sends a payload with no tracking: zero or one delivery, any order.
    pub fn send_unreliable(&mut self, payload: &[u8]) -> Result<()> {
        if !self.state.can_send() {
            return Err(ErrorKind::NotConnected);
        }
        if payload.len() + 1 > self.mtu {
            return Err(ErrorKind::MessageTooLarge { size: payload.len(), max: self.mtu - 1 });
        }
        let mut buffer = self.ack.take_buffer();
        buffer.push(PacketType::Unreliable as u8);
        buffer.extend_from_slice(payload);
        self.out.push_back(buffer);
        Ok(())
    }

    /// Sends a message with exactly-once, in-order delivery.
    pub fn send_reliable(&mut self, message: &[u8], now: Instant) -> Result<()> {
        if !self.state.can_send() {
            return Err(ErrorKind::NotConnected);
        }
        self.ack.send_reliable(message, now)
    }

    /// Sends a fire-and-forget payload whose fate is reported through the
    /// returned token.
    pub fn send_notify(&mut self, payload: &[u8], now: Instant) -> Result<NotifyToken> {
        if !self.state.can_send() {
            return Err(ErrorKind::NotConnected);
        }
        self.ack.send_notify(payload, now)
    }

    /// Next outgoing datagram queued by the state machine or the
    /// reliability engine.
    pub fn pop_outgoing(&mut self) -> Option<Vec<u8>> {
        self.out.pop_front().or_else(|| self.ack.pop_send())
    }

    /// Records that a datagram was written to the socket for this
    /// connection, pushing back the next keep-alive.
    pub fn set_send_time(&mut self, now: Instant) {
        self.keep_alive.set_send_time(now);
    }

    fn queue_command(&mut self, command: Command, payload: &[u8]) {
        let mut buffer = self.ack.take_buffer();
        buffer.push(PacketType::Command as u8);
        buffer.push(command as u8);
        buffer.extend_from_slice(payload);
        self.out.push_back(buffer);
    }

    // --- receiving -------------------------------------------------------

    /// Processes one datagram from this connection's endpoint.
    ///
    /// Any datagram counts as liveness for the timeout timer. Malformed
    /// datagrams return an error and are dropped by the caller; an
    /// unknown packet type is a protocol violation and tears the
    /// connection down.
    pub fn handle_packet(&mut self, data: &[u8], now: Instant) -> Result<()> {
        if data.is_empty() {
            return Err(ErrorKind::PacketTooShort);
        }
        self.timeout.set_receive_time(now);

        let packet_type = match PacketType::try_from(data[0]) {
            Ok(packet_type) => packet_type,
            Err(e) => {
                warn!(addr = %self.addr, byte = data[0], "unknown packet type, disconnecting");
                self.internal_disconnect(DisconnectReason::InvalidPacket, true, now);
                return Err(e);
            }
        };

        match packet_type {
            PacketType::Command => self.handle_command(data, now),
            PacketType::KeepAlive => Ok(()),
            PacketType::Unreliable => self.handle_unreliable(data),
            PacketType::Notify => self.handle_notify(data, now),
            PacketType::NotifyAck | PacketType::Ack => self.handle_ack(data, now),
            PacketType::Reliable => self.handle_reliable(data, now),
            PacketType::ReliableFragment => self.handle_fragment(data, now),
        }
    }

    fn handle_command(&mut self, data: &[u8], now: Instant) -> Result<()> {
        if data.len() < COMMAND_HEADER_SIZE {
            return Err(ErrorKind::PacketTooShort);
        }
        match Command::try_from(data[1])? {
            Command::ConnectRequest => {
                match self.state {
                    // the accept may have been lost; answer again
                    ConnectionState::Connected => {
                        self.queue_command(Command::ConnectionAccepted, &[])
                    }
                    ConnectionState::Created => self.accept(),
                    _ => trace!(addr = %self.addr, "connect request ignored in {:?}", self.state),
                }
                Ok(())
            }
            Command::ConnectionAccepted => {
                if self.state == ConnectionState::Connecting {
                    self.set_state(ConnectionState::Connected);
                    let _ = self.events.send(PeerEvent::Connected { addr: self.addr });
                } else {
                    trace!(addr = %self.addr, "accept ignored in {:?}", self.state);
                }
                Ok(())
            }
            Command::ConnectionRejected => {
                if self.state == ConnectionState::Connecting {
                    let reason = match data.get(COMMAND_HEADER_SIZE) {
                        Some(&byte) => RejectReason::try_from(byte)?,
                        None => RejectReason::None,
                    };
                    self.failed_to_connect(reason);
                }
                Ok(())
            }
            Command::Disconnect => {
                if let Some(&byte) = data.get(COMMAND_HEADER_SIZE) {
                    trace!(addr = %self.addr, reason = byte, "remote disconnect");
                }
                self.internal_disconnect(DisconnectReason::RequestedByRemotePeer, false, now);
                Ok(())
            }
        }
    }

    fn handle_unreliable(&mut self, data: &[u8]) -> Result<()> {
        if !self.state.is_connected() {
            trace!(addr = %self.addr, "unreliable payload before connected, dropped");
            return Ok(());
        }
        if data.len() < 2 {
            return Err(ErrorKind::PacketTooShort);
        }
        let _ = self.events.send(PeerEvent::Data {
            addr: self.addr,
            payload: data[1..].to_vec(),
        });
        Ok(())
    }

    fn handle_notify(&mut self, data: &[u8], now: Instant) -> Result<()> {
        if !self.state.is_connected() {
            trace!(addr = %self.addr, "notify payload before connected, dropped");
            return Ok(());
        }
        if let Some(payload) = self.ack.receive_notify(data, now)? {
            let _ = self.events.send(PeerEvent::Data { addr: self.addr, payload });
        }
        Ok(())
    }

    fn handle_ack(&mut self, data: &[u8], now: Instant) -> Result<()> {
        if !self.state.is_connected() {
            return Ok(());
        }
        self.ack.receive_ack(data, now)
    }

    fn handle_reliable(&mut self, data: &[u8], now: Instant) -> Result<()> {
        if !self.state.is_connected() {
            trace!(addr = %self.addr, "reliable payload before connected, dropped");
            return Ok(());
        }
        self.ack.receive_reliable(data, false, now)?;
        self.release_ordered();
        Ok(())
    }

    fn handle_fragment(&mut self, data: &[u8], now: Instant) -> Result<()> {
        if !self.state.is_connected() {
            trace!(addr = %self.addr, "fragment before connected, dropped");
            return Ok(());
        }
        if self.ack.invalid_fragment(data)? {
            warn!(addr = %self.addr, "fragment index over budget, disconnecting");
            self.internal_disconnect(DisconnectReason::InvalidPacket, true, now);
            return Ok(());
        }
        self.ack.receive_reliable(data, true, now)?;
        self.release_ordered();
        Ok(())
    }

    /// Releases every reliable packet that is now deliverable in order.
    fn release_ordered(&mut self) {
        while let Some(received) = self.ack.next_reliable_packet() {
            if received.is_fragment {
                self.release_fragmented(received);
            } else {
                self.release_batched(received);
            }
        }
    }

    /// Splits a reliable packet back into its batched messages.
    fn release_batched(&mut self, received: ReliableReceived) {
        let payload = received.payload;
        let mut offset = 0;
        while offset + RELIABLE_MESSAGE_LENGTH_SIZE <= payload.len() {
            let len = BigEndian::read_u16(&payload[offset..]) as usize;
            offset += RELIABLE_MESSAGE_LENGTH_SIZE;
            if offset + len > payload.len() {
                warn!(addr = %self.addr, "truncated batch entry, dropping rest of packet");
                break;
            }
            let _ = self.events.send(PeerEvent::Data {
                addr: self.addr,
                payload: payload[offset..offset + len].to_vec(),
            });
            offset += len;
        }
        self.ack.reclaim(payload);
    }

    /// Joins a complete run of fragments back into one message. The head
    /// fragment's index says how many more follow.
    fn release_fragmented(&mut self, head: ReliableReceived) {
        let remaining = usize::from(head.fragment_index());
        let mut message =
            Vec::with_capacity((remaining + 1) * self.ack.size_per_fragment());
        message.extend_from_slice(&head.payload[1..]);
        self.ack.reclaim(head.payload);

        for _ in 0..remaining {
            // next_reliable_packet only releases a head once the whole
            // message is queued behind it
            let Some(next) = self.ack.next_fragment() else {
                warn!(addr = %self.addr, "fragment run ended early");
                return;
            };
            message.extend_from_slice(&next.payload[1..]);
            self.ack.reclaim(next.payload);
        }
        let _ = self.events.send(PeerEvent::Data { addr: self.addr, payload: message });
    }

    // --- per-tick update -------------------------------------------------

    /// Drives retries, keep-alives, timeout detection and the grace
    /// window. Call once per tick.
    pub fn update(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connecting => self.update_connecting(now),
            ConnectionState::Connected => self.update_connected(now),
            ConnectionState::Disconnected => {
                if self.disconnected.time_to_remove(now) {
                    self.set_state(ConnectionState::Removing);
                }
            }
            _ => {}
        }
    }

    fn update_connecting(&mut self, now: Instant) {
        if !self.connecting.time_attempt(now) {
            return;
        }
        if self.connecting.max_attempts() {
            self.failed_to_connect(RejectReason::Timeout);
        } else {
            self.connecting.on_attempt(now);
            let key = std::mem::take(&mut self.key);
            self.queue_command(Command::ConnectRequest, &key);
            self.key = key;
        }
    }

    fn update_connected(&mut self, now: Instant) {
        if self.timeout.time_to_disconnect(now) {
            self.internal_disconnect(DisconnectReason::Timeout, true, now);
            return;
        }

        self.ack.update(now);

        if self.keep_alive.time_to_send(now) {
            let mut buffer = self.ack.take_buffer();
            buffer.push(PacketType::KeepAlive as u8);
            self.out.push_back(buffer);
            self.keep_alive.set_send_time(now);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .finish()
    }
}
