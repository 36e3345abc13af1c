//! The per-connection reliability engine.
//!
//! One `AckSystem` owns both directions of a connection's data traffic:
//! every outgoing notify/reliable packet carries the latest received
//! sequence plus a 64 bit mask of the receipts before it, and every
//! incoming header is folded back into that state. Reliable packets are
//! retransmitted when an ack shows them missing; notify packets are never
//! retransmitted but their token resolves to delivered or lost exactly
//! once.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use byteorder::{BigEndian, ByteOrder};
use relink_core::{
    config::Config,
    error::{ErrorKind, Result},
    pool::BufferPool,
};
use tracing::warn;

use crate::{
    packet::{
        PacketType, ACK_HEADER_SIZE, MIN_FRAGMENT_PACKET_SIZE, MIN_RELIABLE_PACKET_SIZE,
        RELIABLE_HEADER_SIZE, RELIABLE_MESSAGE_LENGTH_SIZE, SEQUENCE_HEADER_SIZE,
    },
    ring_buffer::RingBuffer,
    sequencer::Sequencer,
};

/// Width of the ack bitfield carried in every sequenced header.
const MASK_SIZE: i64 = 64;

const NOTIFY_PENDING: u8 = 0;
const NOTIFY_DELIVERED: u8 = 1;
const NOTIFY_LOST: u8 = 2;

/// Fate of a notify send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    /// No ack covering the packet has arrived yet.
    Pending,
    /// The remote acknowledged the packet.
    Delivered,
    /// The packet rotated out of the ack window unacknowledged.
    Lost,
}

/// Handle returned from a notify send. Resolves exactly once.
#[derive(Debug, Clone)]
pub struct NotifyToken {
    state: Arc<AtomicU8>,
}

impl NotifyToken {
    /// Current fate of the notify packet.
    pub fn status(&self) -> NotifyStatus {
        match self.state.load(Ordering::Acquire) {
            NOTIFY_DELIVERED => NotifyStatus::Delivered,
            NOTIFY_LOST => NotifyStatus::Lost,
            _ => NotifyStatus::Pending,
        }
    }

    /// True once the packet resolved to delivered or lost.
    pub fn is_resolved(&self) -> bool {
        self.status() != NotifyStatus::Pending
    }
}

fn resolve_notify(state: &Arc<AtomicU8>, delivered: bool) {
    let resolved = if delivered { NOTIFY_DELIVERED } else { NOTIFY_LOST };
    // compare_exchange keeps the first resolution even if an ack is
    // processed twice before the slot is removed
    let _ = state.compare_exchange(
        NOTIFY_PENDING,
        resolved,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
}

/// One slot in the sent-packet ring: either a notify awaiting its fate or
/// a reference to a reliable packet (keyed by order number, since a
/// retransmitted packet occupies several sequence slots at once).
#[derive(Clone)]
enum Ackable {
    Notify(Arc<AtomicU8>),
    Reliable(u64),
}

/// A reliable packet buffered until acknowledged. The buffer holds the
/// full datagram; the sequence fields are patched before every
/// (re)transmission while the order number stays fixed.
struct ReliablePacket {
    buffer: Vec<u8>,
    sequences: Vec<u64>,
    last_sequence: u64,
}

/// A reliable packet released from the receive ring in order.
pub struct ReliableReceived {
    /// Packet payload: batched `[len][message]` entries, or
    /// `[fragment_index][slice]` for a fragment.
    pub payload: Vec<u8>,
    /// Whether this is one fragment of a larger message.
    pub is_fragment: bool,
}

impl ReliableReceived {
    /// Fragment index stored in the first payload byte. Indices count
    /// down, so the first fragment of a message states how many follow.
    pub fn fragment_index(&self) -> u8 {
        self.payload.first().copied().unwrap_or(0)
    }
}

/// Sequenced ack state plus send/receive buffers for one connection.
pub struct AckSystem {
    sent_ackable: RingBuffer<Ackable>,
    reliable_sent: HashMap<u64, ReliablePacket>,
    reliable_order: Sequencer,
    reliable_receive: RingBuffer<ReliableReceived>,
    to_resend: Vec<u64>,
    /// Reliable batch currently being filled, as (order, buffer).
    next_batch: Option<(u64, Vec<u8>)>,

    /// Most recent sequence received; sent with the next packet.
    latest_ack_sequence: u64,
    /// Receipt mask of the sequences before `latest_ack_sequence`.
    ack_mask: u64,

    last_sent_time: Instant,
    last_sent_ack: u64,
    empty_ack_count: u32,

    out: VecDeque<Vec<u8>>,
    pool: BufferPool,

    mtu: usize,
    max_fragments: u8,
    size_per_fragment: usize,
    max_packets_in_send_buffer: usize,
    time_before_empty_ack: Duration,
    receives_before_empty_ack: u32,
    empty_ack_limit: u32,
}

impl AckSystem {
    /// Creates the engine for one connection from the peer's config.
    pub fn new(config: &Config, now: Instant) -> Self {
        let bits = config.sequence_size;
        let sent_ackable: RingBuffer<Ackable> = RingBuffer::new(bits);
        // start one before 0 so the first received packet has distance 1
        let latest_ack_sequence = sent_ackable.sequencer().move_in_bounds(u64::MAX);

        let mut system = Self {
            sent_ackable,
            reliable_sent: HashMap::new(),
            reliable_order: Sequencer::new(bits),
            reliable_receive: RingBuffer::new(bits),
            to_resend: Vec::new(),
            next_batch: None,
            latest_ack_sequence,
            ack_mask: 0,
            last_sent_time: now,
            last_sent_ack: latest_ack_sequence,
            empty_ack_count: 0,
            out: VecDeque::new(),
            pool: BufferPool::new(
                config.mtu,
                config.buffer_pool_start_size,
                config.buffer_pool_max_size,
            ),
            mtu: config.mtu,
            max_fragments: config.max_reliable_fragments,
            size_per_fragment: config.mtu - MIN_FRAGMENT_PACKET_SIZE,
            max_packets_in_send_buffer: config
                .max_reliable_packets_in_send_buffer_per_connection,
            time_before_empty_ack: config.time_before_empty_ack,
            receives_before_empty_ack: config.receives_before_empty_ack,
            empty_ack_limit: config.empty_ack_limit,
        };
        system.on_send(now);
        system
    }

    /// Bytes of payload that fit into one fragment.
    pub fn size_per_fragment(&self) -> usize {
        self.size_per_fragment
    }

    /// Largest reliable message the fragmentation path accepts.
    pub fn max_fragmented_size(&self) -> usize {
        usize::from(self.max_fragments) * self.size_per_fragment
    }

    /// Number of reliable packets waiting for acknowledgement.
    pub fn unacked_reliable_count(&self) -> usize {
        self.reliable_sent.len()
    }

    /// Next queued outgoing datagram, if any.
    pub fn pop_send(&mut self) -> Option<Vec<u8>> {
        self.out.pop_front()
    }

    /// Takes a buffer from the connection's pool.
    pub fn take_buffer(&mut self) -> Vec<u8> {
        self.pool.take()
    }

    /// Returns a consumed buffer to the pool.
    pub fn reclaim(&mut self, buffer: Vec<u8>) {
        self.pool.put(buffer);
    }

    // --- sending ---------------------------------------------------------

    /// Sends a fire-and-forget payload whose fate will be reported through
    /// the returned token.
    pub fn send_notify(&mut self, payload: &[u8], now: Instant) -> Result<NotifyToken> {
        if payload.len() + SEQUENCE_HEADER_SIZE > self.mtu {
            return Err(ErrorKind::MessageTooLarge {
                size: payload.len(),
                max: self.mtu - SEQUENCE_HEADER_SIZE,
            });
        }
        let state = Arc::new(AtomicU8::new(NOTIFY_PENDING));
        let sequence = self
            .sent_ackable
            .enqueue(Ackable::Notify(state.clone()))
            .ok_or(ErrorKind::SendBufferFull)?;

        let mut buffer = self.pool.take();
        buffer.resize(SEQUENCE_HEADER_SIZE, 0);
        buffer[0] = PacketType::Notify as u8;
        BigEndian::write_u16(&mut buffer[1..3], sequence as u16);
        BigEndian::write_u16(&mut buffer[3..5], self.latest_ack_sequence as u16);
        BigEndian::write_u64(&mut buffer[5..13], self.ack_mask);
        buffer.extend_from_slice(payload);
        self.queue_send(buffer, now);

        Ok(NotifyToken { state })
    }

    /// Queues a reliable message. Small messages are batched into the
    /// current reliable packet; messages over the MTU are fragmented.
    pub fn send_reliable(&mut self, message: &[u8], now: Instant) -> Result<()> {
        if !self.can_send_reliable() {
            return Err(ErrorKind::SendBufferFull);
        }

        if message.len() + MIN_RELIABLE_PACKET_SIZE > self.mtu {
            if self.max_fragments == 0 {
                return Err(ErrorKind::MessageTooLarge {
                    size: message.len(),
                    max: self.mtu - MIN_RELIABLE_PACKET_SIZE,
                });
            }
            // flush the open batch first so the fragmented message keeps
            // its place in the reliable order
            if let Some((order, buffer)) = self.next_batch.take() {
                self.send_reliable_packet(order, buffer, now);
            }
            return self.send_fragmented(message, now);
        }

        let entry_len = message.len() + RELIABLE_MESSAGE_LENGTH_SIZE;
        let batch_full = match &self.next_batch {
            Some((_, buffer)) => buffer.len() + entry_len > self.mtu,
            None => false,
        };
        if batch_full {
            if let Some((order, buffer)) = self.next_batch.take() {
                self.send_reliable_packet(order, buffer, now);
            }
        }
        if self.next_batch.is_none() {
            self.next_batch = Some(self.create_reliable_buffer(PacketType::Reliable));
        }
        if let Some((_, buffer)) = self.next_batch.as_mut() {
            let offset = buffer.len();
            buffer.resize(offset + RELIABLE_MESSAGE_LENGTH_SIZE, 0);
            BigEndian::write_u16(&mut buffer[offset..], message.len() as u16);
            buffer.extend_from_slice(message);
        }
        Ok(())
    }

    fn send_fragmented(&mut self, message: &[u8], now: Instant) -> Result<()> {
        if message.len() > self.max_fragmented_size() {
            return Err(ErrorKind::MessageTooLarge {
                size: message.len(),
                max: self.max_fragmented_size(),
            });
        }

        let fragments = message.len().div_ceil(self.size_per_fragment);
        // all fragments must be transmitted together: a partial send would
        // leave the receiver's reliable stream waiting on a fragment that
        // holds no slot and can never be reported lost
        if fragments > self.reliable_send_capacity() {
            return Err(ErrorKind::SendBufferFull);
        }
        for i in 0..fragments {
            // indices descend so the first fragment received in order says
            // how many more to wait for
            let fragment_index = fragments - i - 1;
            let (order, mut buffer) = self.create_reliable_buffer(PacketType::ReliableFragment);
            buffer.push(fragment_index as u8);

            let start = i * self.size_per_fragment;
            let end = (start + self.size_per_fragment).min(message.len());
            buffer.extend_from_slice(&message[start..end]);
            self.send_reliable_packet(order, buffer, now);
        }
        Ok(())
    }

    fn can_send_reliable(&self) -> bool {
        self.reliable_send_capacity() > 0
    }

    /// How many more sequence slots the send side can hand out right now:
    /// consecutive enqueues left in the sent ring, capped by the reliable
    /// send-buffer budget.
    fn reliable_send_capacity(&self) -> usize {
        let sequencer = self.sent_ackable.sequencer();
        let span = sequencer.move_in_bounds(
            self.sent_ackable.write_index() + sequencer.capacity()
                - self.sent_ackable.read_index(),
        ) as usize;
        let ring_free = self.sent_ackable.capacity() - 1 - span;
        let budget = self
            .max_packets_in_send_buffer
            .saturating_sub(self.sent_ackable.count());
        ring_free.min(budget)
    }

    /// Reserves the next order number and a buffer with the reliable
    /// header laid out, type byte and order already written.
    fn create_reliable_buffer(&mut self, packet_type: PacketType) -> (u64, Vec<u8>) {
        let order = self.reliable_order.next();
        let mut buffer = self.pool.take();
        buffer.resize(RELIABLE_HEADER_SIZE, 0);
        buffer[0] = packet_type as u8;
        BigEndian::write_u16(&mut buffer[SEQUENCE_HEADER_SIZE..], order as u16);
        (order, buffer)
    }

    fn send_reliable_packet(&mut self, order: u64, buffer: Vec<u8>, now: Instant) {
        self.reliable_sent.insert(
            order,
            ReliablePacket { buffer, sequences: Vec::new(), last_sequence: 0 },
        );
        self.transmit_reliable(order, now);
    }

    /// Assigns a fresh sequence to a buffered reliable packet, patches its
    /// header and queues the datagram.
    fn transmit_reliable(&mut self, order: u64, now: Instant) {
        let Some(sequence) = self.sent_ackable.enqueue(Ackable::Reliable(order)) else {
            // callers check capacity first, so this is a safety net: keep
            // the packet on the resend list so the next ack re-drives it
            warn!(order, "sent packet queue full, queued for retransmission");
            if !self.to_resend.contains(&order) {
                self.to_resend.push(order);
            }
            return;
        };
        let latest = self.latest_ack_sequence;
        let mask = self.ack_mask;
        let datagram = match self.reliable_sent.get_mut(&order) {
            Some(packet) => {
                packet.sequences.push(sequence);
                packet.last_sequence = sequence;
                BigEndian::write_u16(&mut packet.buffer[1..3], sequence as u16);
                BigEndian::write_u16(&mut packet.buffer[3..5], latest as u16);
                BigEndian::write_u64(&mut packet.buffer[5..13], mask);
                packet.buffer.clone()
            }
            None => {
                self.sent_ackable.remove_at(sequence);
                return;
            }
        };
        self.queue_send(datagram, now);
    }

    /// Flushes the open reliable batch and emits a stand-alone ack when
    /// traffic has been one-directional for too long. Call once per tick.
    pub fn update(&mut self, now: Instant) {
        if self.next_batch.is_some() && self.can_send_reliable() {
            if let Some((order, buffer)) = self.next_batch.take() {
                self.send_reliable_packet(order, buffer, now);
            }
        }
        if self.should_send_empty_ack() && self.time_to_send_ack(now) {
            self.send_ack(now);
        }
    }

    fn time_to_send_ack(&self, now: Instant) -> bool {
        self.last_sent_time + self.time_before_empty_ack < now
    }

    fn should_send_empty_ack(&self) -> bool {
        self.empty_ack_count < self.empty_ack_limit
    }

    fn send_ack(&mut self, now: Instant) {
        let mut buffer = self.pool.take();
        buffer.resize(ACK_HEADER_SIZE, 0);
        buffer[0] = PacketType::Ack as u8;
        BigEndian::write_u16(&mut buffer[1..3], self.latest_ack_sequence as u16);
        BigEndian::write_u64(&mut buffer[3..11], self.ack_mask);
        self.queue_send(buffer, now);
    }

    fn queue_send(&mut self, datagram: Vec<u8>, now: Instant) {
        self.out.push_back(datagram);
        self.on_send(now);
    }

    fn on_send(&mut self, now: Instant) {
        self.empty_ack_count += 1;
        self.last_sent_ack = self.latest_ack_sequence;
        self.last_sent_time = now;
    }

    // --- receiving -------------------------------------------------------

    /// Processes an incoming notify packet. Returns the payload when the
    /// packet is fresh; duplicates and late arrivals update ack state but
    /// are not surfaced.
    pub fn receive_notify(&mut self, packet: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        if packet.len() < SEQUENCE_HEADER_SIZE {
            return Err(ErrorKind::PacketTooShort);
        }
        let sequence = u64::from(BigEndian::read_u16(&packet[1..3]));
        let ack_sequence = u64::from(BigEndian::read_u16(&packet[3..5]));
        let ack_mask = BigEndian::read_u64(&packet[5..13]);

        let distance = self.process_incoming_header(sequence, ack_sequence, ack_mask, now);
        if distance <= 0 {
            return Ok(None);
        }
        Ok(Some(packet[SEQUENCE_HEADER_SIZE..].to_vec()))
    }

    /// Processes an incoming reliable or fragment packet, inserting it into
    /// the receive ring keyed by its order number. Late and duplicate
    /// orders are dropped after their ack state is recorded.
    pub fn receive_reliable(&mut self, packet: &[u8], is_fragment: bool, now: Instant) -> Result<()> {
        let min = if is_fragment { MIN_FRAGMENT_PACKET_SIZE } else { MIN_RELIABLE_PACKET_SIZE };
        if packet.len() < min {
            return Err(ErrorKind::PacketTooShort);
        }
        let sequence = u64::from(BigEndian::read_u16(&packet[1..3]));
        let ack_sequence = u64::from(BigEndian::read_u16(&packet[3..5]));
        let ack_mask = BigEndian::read_u64(&packet[5..13]);
        let order = u64::from(BigEndian::read_u16(&packet[13..15]));

        // acks are processed even for late packets
        let _ = self.process_incoming_header(sequence, ack_sequence, ack_mask, now);

        if self.reliable_receive.distance_to_read(order) < 0 {
            // already released to the application
            return Ok(());
        }
        if self.reliable_receive.exists(order) {
            // duplicate of a buffered packet
            return Ok(());
        }

        let mut payload = self.pool.take();
        payload.extend_from_slice(&packet[RELIABLE_HEADER_SIZE..]);
        self.reliable_receive.insert_at(order, ReliableReceived { payload, is_fragment });
        Ok(())
    }

    /// Whether a fragment packet carries an index outside the configured
    /// budget, which is a protocol violation by the sender.
    pub fn invalid_fragment(&self, packet: &[u8]) -> Result<bool> {
        if packet.len() < MIN_FRAGMENT_PACKET_SIZE {
            return Err(ErrorKind::PacketTooShort);
        }
        let fragment_index = packet[RELIABLE_HEADER_SIZE];
        Ok(fragment_index >= self.max_fragments)
    }

    /// Processes a stand-alone ack packet.
    pub fn receive_ack(&mut self, packet: &[u8], now: Instant) -> Result<()> {
        if packet.len() < ACK_HEADER_SIZE {
            return Err(ErrorKind::PacketTooShort);
        }
        let ack_sequence = u64::from(BigEndian::read_u16(&packet[1..3]));
        let ack_mask = BigEndian::read_u64(&packet[3..11]);
        self.check_sent_queue(ack_sequence, ack_mask, now);
        Ok(())
    }

    /// Returns the next reliable packet in order, once available. For a
    /// fragment this only returns the head once every remaining fragment
    /// of the message is queued behind it.
    pub fn next_reliable_packet(&mut self) -> Option<ReliableReceived> {
        let head = self.reliable_receive.try_peek()?;
        if !head.is_fragment || self.full_fragmented_message_queued() {
            return self.reliable_receive.try_dequeue();
        }
        None
    }

    /// Dequeues the next fragment of a message whose head was already
    /// returned by [`next_reliable_packet`](Self::next_reliable_packet).
    pub fn next_fragment(&mut self) -> Option<ReliableReceived> {
        self.reliable_receive.try_dequeue()
    }

    fn full_fragmented_message_queued(&self) -> bool {
        let read = self.reliable_receive.read_index();
        let Some(head) = self.reliable_receive.get(read) else {
            return false;
        };
        // an index of n means n more fragments follow in consecutive slots
        let remaining = u64::from(head.fragment_index());
        (0..remaining).all(|i| self.reliable_receive.exists(read + i + 1))
    }

    // --- ack state -------------------------------------------------------

    /// Folds a received sequenced header into the ack state and processes
    /// the piggybacked ack. Returns the distance of `sequence` from the
    /// latest previously received sequence (<= 0 for duplicates and late
    /// arrivals).
    fn process_incoming_header(
        &mut self,
        sequence: u64,
        ack_sequence: u64,
        ack_mask: u64,
        now: Instant,
    ) -> i64 {
        let distance = self.sent_ackable.sequencer().distance(sequence, self.latest_ack_sequence);
        self.set_ack_values(sequence, distance, now);
        self.check_sent_queue(ack_sequence, ack_mask, now);
        distance
    }

    fn set_ack_values(&mut self, sequence: u64, distance: i64, now: Instant) {
        if distance > 0 {
            if distance >= MASK_SIZE {
                // the whole window went missing; restart the mask at the
                // new sequence
                self.ack_mask = 1;
            } else {
                self.ack_mask = (self.ack_mask << distance) | 1;
            }
            self.latest_ack_sequence = sequence;
        } else {
            let behind = -distance;
            if behind >= MASK_SIZE {
                return;
            }
            self.ack_mask |= 1u64 << behind;
        }

        // receiving traffic restarts the empty-ack budget, and enough
        // unsent receipts force an ack out immediately
        self.empty_ack_count = 0;
        let unsent = self
            .sent_ackable
            .sequencer()
            .distance(self.latest_ack_sequence, self.last_sent_ack);
        if unsent > i64::from(self.receives_before_empty_ack) {
            self.send_ack(now);
        }
    }

    fn check_sent_queue(&mut self, sequence: u64, mask: u64, now: Instant) {
        // an ack older than the queue has nothing left to resolve
        if self.sent_ackable.distance_to_read(sequence) < 0 {
            return;
        }
        self.resolve_sent_queue(sequence, mask);
        self.sent_ackable.move_read_to_next_non_empty();
        self.resend_lost(now);
    }

    fn resolve_sent_queue(&mut self, sequence: u64, mask: u64) {
        let sequencer = self.sent_ackable.sequencer().clone();
        let start = self.sent_ackable.read_index();
        let end = self.sent_ackable.write_index();
        let span = sequencer.move_in_bounds(end + sequencer.capacity() - start);

        for i in 0..span {
            let index = sequencer.move_in_bounds(start + i);
            let Some(ackable) = self.sent_ackable.get(index).cloned() else {
                continue;
            };

            let distance = sequencer.distance(sequence, index);
            // sent after the ack was generated, nothing to learn yet
            if distance < 0 {
                continue;
            }
            let lost = distance >= MASK_SIZE || (mask & (1u64 << distance)) == 0;

            match ackable {
                Ackable::Notify(state) => {
                    resolve_notify(&state, !lost);
                    self.sent_ackable.remove_at(index);
                }
                Ackable::Reliable(order) => {
                    if lost {
                        self.mark_reliable_lost(sequence, order);
                    } else {
                        self.reliable_acked(order);
                    }
                }
            }
        }
    }

    fn mark_reliable_lost(&mut self, ack_sequence: u64, order: u64) {
        // only resend once the ack could have covered the latest
        // transmission of this packet
        let Some(packet) = self.reliable_sent.get(&order) else {
            return;
        };
        let covered = self
            .sent_ackable
            .sequencer()
            .distance(ack_sequence, packet.last_sequence)
            > 0;
        if covered && !self.to_resend.contains(&order) {
            self.to_resend.push(order);
        }
    }

    fn reliable_acked(&mut self, order: u64) {
        if let Some(packet) = self.reliable_sent.remove(&order) {
            for sequence in &packet.sequences {
                self.sent_ackable.remove_at(*sequence);
            }
            self.to_resend.retain(|o| *o != order);
            self.pool.put(packet.buffer);
        }
    }

    fn resend_lost(&mut self, now: Instant) {
        let orders = std::mem::take(&mut self.to_resend);
        for order in orders {
            if !self.reliable_sent.contains_key(&order) {
                continue;
            }
            if !self.can_send_reliable() {
                warn!(order, "sent packet queue full, delaying retransmission");
                self.to_resend.push(order);
                continue;
            }
            self.transmit_reliable(order, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            sequence_size: 4,
            mtu: 100,
            max_reliable_fragments: 3,
            receives_before_empty_ack: 2,
            ..Config::default()
        }
    }

    fn now() -> Instant {
        Instant::now()
    }

    fn later(base: Instant) -> Instant {
        base + Duration::from_millis(200)
    }

    /// Pulls the single batched message out of a reliable packet payload.
    fn unbatch(payload: &[u8]) -> Vec<Vec<u8>> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let len = BigEndian::read_u16(&payload[offset..]) as usize;
            offset += RELIABLE_MESSAGE_LENGTH_SIZE;
            messages.push(payload[offset..offset + len].to_vec());
            offset += len;
        }
        messages
    }

    /// Sends one reliable message and flushes it into a datagram.
    fn send_flushed(system: &mut AckSystem, message: &[u8], at: Instant) -> Vec<u8> {
        system.send_reliable(message, at).unwrap();
        system.update(at);
        system.pop_send().unwrap()
    }

    #[test]
    fn test_reliable_round_trip() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);
        let mut b = AckSystem::new(&test_config(), t);

        let datagram = send_flushed(&mut a, b"hello", t);
        assert_eq!(datagram[0], PacketType::Reliable as u8);

        b.receive_reliable(&datagram, false, t).unwrap();
        let received = b.next_reliable_packet().unwrap();
        assert_eq!(unbatch(&received.payload), vec![b"hello".to_vec()]);
        assert!(b.next_reliable_packet().is_none());
    }

    #[test]
    fn test_small_messages_batch_into_one_datagram() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);
        let mut b = AckSystem::new(&test_config(), t);

        a.send_reliable(b"one", t).unwrap();
        a.send_reliable(b"two", t).unwrap();
        a.update(t);

        let datagram = a.pop_send().unwrap();
        assert!(a.pop_send().is_none());

        b.receive_reliable(&datagram, false, t).unwrap();
        let received = b.next_reliable_packet().unwrap();
        assert_eq!(unbatch(&received.payload), vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_out_of_order_release_blocks_until_gap_fills() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);
        let mut b = AckSystem::new(&test_config(), t);

        let first = send_flushed(&mut a, b"first", t);
        let second = send_flushed(&mut a, b"second", t);

        b.receive_reliable(&second, false, t).unwrap();
        assert!(b.next_reliable_packet().is_none());

        b.receive_reliable(&first, false, t).unwrap();
        let m1 = b.next_reliable_packet().unwrap();
        let m2 = b.next_reliable_packet().unwrap();
        assert_eq!(unbatch(&m1.payload), vec![b"first".to_vec()]);
        assert_eq!(unbatch(&m2.payload), vec![b"second".to_vec()]);
    }

    #[test]
    fn test_duplicate_reliable_delivered_once() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);
        let mut b = AckSystem::new(&test_config(), t);

        let datagram = send_flushed(&mut a, b"once", t);
        b.receive_reliable(&datagram, false, t).unwrap();
        b.receive_reliable(&datagram, false, t).unwrap();

        assert!(b.next_reliable_packet().is_some());
        assert!(b.next_reliable_packet().is_none());

        // a duplicate arriving after release is also dropped
        b.receive_reliable(&datagram, false, t).unwrap();
        assert!(b.next_reliable_packet().is_none());
    }

    #[test]
    fn test_ack_frees_sent_buffer() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);
        let mut b = AckSystem::new(&test_config(), t);

        let datagram = send_flushed(&mut a, b"data", t);
        assert_eq!(a.unacked_reliable_count(), 1);

        b.receive_reliable(&datagram, false, t).unwrap();
        b.update(later(t));
        let ack = b.pop_send().unwrap();
        assert_eq!(ack[0], PacketType::Ack as u8);

        a.receive_ack(&ack, later(t)).unwrap();
        assert_eq!(a.unacked_reliable_count(), 0);
    }

    #[test]
    fn test_lost_reliable_is_resent_and_delivered_in_order() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);
        let mut b = AckSystem::new(&test_config(), t);

        let first = send_flushed(&mut a, b"first", t);
        let second = send_flushed(&mut a, b"second", t);
        drop(first); // lost in transit

        b.receive_reliable(&second, false, t).unwrap();
        assert!(b.next_reliable_packet().is_none());

        b.update(later(t));
        let ack = b.pop_send().unwrap();
        a.receive_ack(&ack, later(t)).unwrap();

        // the first packet went out again under a fresh sequence
        let resent = a.pop_send().unwrap();
        assert_eq!(resent[0], PacketType::Reliable as u8);
        b.receive_reliable(&resent, false, later(t)).unwrap();

        let m1 = b.next_reliable_packet().unwrap();
        let m2 = b.next_reliable_packet().unwrap();
        assert_eq!(unbatch(&m1.payload), vec![b"first".to_vec()]);
        assert_eq!(unbatch(&m2.payload), vec![b"second".to_vec()]);
        assert!(b.next_reliable_packet().is_none());
    }

    #[test]
    fn test_notify_resolves_exactly_once() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);
        let mut b = AckSystem::new(&test_config(), t);

        let lost_token = a.send_notify(b"lost", t).unwrap();
        let _lost_datagram = a.pop_send().unwrap(); // dropped in transit
        let delivered_token = a.send_notify(b"delivered", t).unwrap();
        let delivered_datagram = a.pop_send().unwrap();

        let payload = b.receive_notify(&delivered_datagram, t).unwrap();
        assert_eq!(payload.as_deref(), Some(&b"delivered"[..]));

        b.update(later(t));
        let ack = b.pop_send().unwrap();
        a.receive_ack(&ack, later(t)).unwrap();

        assert_eq!(lost_token.status(), NotifyStatus::Lost);
        assert_eq!(delivered_token.status(), NotifyStatus::Delivered);

        // replaying the ack never flips a resolution
        a.receive_ack(&ack, later(t)).unwrap();
        assert_eq!(lost_token.status(), NotifyStatus::Lost);
        assert_eq!(delivered_token.status(), NotifyStatus::Delivered);
    }

    #[test]
    fn test_late_notify_not_surfaced_but_acked() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);
        let mut b = AckSystem::new(&test_config(), t);

        let token0 = a.send_notify(b"zero", t).unwrap();
        let d0 = a.pop_send().unwrap();
        let token1 = a.send_notify(b"one", t).unwrap();
        let d1 = a.pop_send().unwrap();

        // reordered: the newer packet arrives first
        assert!(b.receive_notify(&d1, t).unwrap().is_some());
        // the older one is late, so its payload is suppressed
        assert!(b.receive_notify(&d0, t).unwrap().is_none());

        // but its receipt made it into the mask, so both deliver
        b.update(later(t));
        let ack = b.pop_send().unwrap();
        a.receive_ack(&ack, later(t)).unwrap();
        assert_eq!(token0.status(), NotifyStatus::Delivered);
        assert_eq!(token1.status(), NotifyStatus::Delivered);
    }

    #[test]
    fn test_fragmentation_waits_for_all_fragments() {
        let t = now();
        let config = test_config();
        let mut a = AckSystem::new(&config, t);
        let mut b = AckSystem::new(&config, t);

        let per_fragment = a.size_per_fragment();
        let message: Vec<u8> = (0..per_fragment * 2 + 10).map(|i| i as u8).collect();
        a.send_reliable(&message, t).unwrap();

        let mut datagrams = Vec::new();
        while let Some(d) = a.pop_send() {
            assert_eq!(d[0], PacketType::ReliableFragment as u8);
            datagrams.push(d);
        }
        assert_eq!(datagrams.len(), 3);

        // deliver out of order: last, first, middle
        b.receive_reliable(&datagrams[2], true, t).unwrap();
        assert!(b.next_reliable_packet().is_none());
        b.receive_reliable(&datagrams[0], true, t).unwrap();
        assert!(b.next_reliable_packet().is_none());
        b.receive_reliable(&datagrams[1], true, t).unwrap();

        let head = b.next_reliable_packet().unwrap();
        assert!(head.is_fragment);
        assert_eq!(head.fragment_index(), 2);

        // reassemble and compare against the original
        let mut rebuilt = head.payload[1..].to_vec();
        for _ in 0..head.fragment_index() {
            let next = b.next_fragment().unwrap();
            rebuilt.extend_from_slice(&next.payload[1..]);
        }
        assert_eq!(rebuilt, message);
    }

    #[test]
    fn test_oversized_message_rejected_before_sending() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);

        let message = vec![0u8; a.max_fragmented_size() + 1];
        let result = a.send_reliable(&message, t);
        assert!(matches!(result, Err(ErrorKind::MessageTooLarge { .. })));
        a.update(t);
        assert!(a.pop_send().is_none());
    }

    #[test]
    fn test_invalid_fragment_index_detected() {
        let t = now();
        let config = test_config();
        let a = AckSystem::new(&config, t);

        let mut packet = vec![0u8; MIN_FRAGMENT_PACKET_SIZE];
        packet[0] = PacketType::ReliableFragment as u8;
        packet[RELIABLE_HEADER_SIZE] = config.max_reliable_fragments; // one past the budget
        assert!(a.invalid_fragment(&packet).unwrap());

        packet[RELIABLE_HEADER_SIZE] = config.max_reliable_fragments - 1;
        assert!(!a.invalid_fragment(&packet).unwrap());
    }

    #[test]
    fn test_enough_receives_force_immediate_ack() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);
        let mut b = AckSystem::new(&test_config(), t);

        // receives_before_empty_ack is 2; the third receive forces an ack
        // out without waiting for the time based path
        for i in 0..3 {
            let datagram = send_flushed(&mut a, &[i], t);
            b.receive_reliable(&datagram, false, t).unwrap();
        }
        let ack = b.pop_send().unwrap();
        assert_eq!(ack[0], PacketType::Ack as u8);
    }

    #[test]
    fn test_send_buffer_backpressure() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);

        // 4 sequence bits leave 15 usable ring slots
        for _ in 0..15 {
            a.send_notify(b"x", t).unwrap();
        }
        let result = a.send_notify(b"x", t);
        assert!(matches!(result, Err(ErrorKind::SendBufferFull)));
    }

    #[test]
    fn test_fragmented_send_needs_room_for_every_fragment() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);

        // 200 bytes at 84 per fragment needs 3 slots; 13 unacked notifies
        // leave only 2 of the 15 usable ring slots
        let message: Vec<u8> = (0..200).map(|i| i as u8).collect();
        for _ in 0..13 {
            a.send_notify(b"x", t).unwrap();
        }
        let result = a.send_reliable(&message, t);
        assert!(matches!(result, Err(ErrorKind::SendBufferFull)));
        // nothing was buffered or transmitted for the rejected message
        assert_eq!(a.unacked_reliable_count(), 0);
        let mut queued = 0;
        while let Some(d) = a.pop_send() {
            assert_eq!(d[0], PacketType::Notify as u8);
            queued += 1;
        }
        assert_eq!(queued, 13);

        // with exactly enough slots every fragment goes out
        let mut a = AckSystem::new(&test_config(), t);
        for _ in 0..12 {
            a.send_notify(b"x", t).unwrap();
        }
        a.send_reliable(&message, t).unwrap();
        let fragments = std::iter::from_fn(|| a.pop_send())
            .filter(|d| d[0] == PacketType::ReliableFragment as u8)
            .count();
        assert_eq!(fragments, 3);
    }

    #[test]
    fn test_short_packets_rejected_without_panic() {
        let t = now();
        let mut a = AckSystem::new(&test_config(), t);

        assert!(matches!(a.receive_ack(&[6, 0], t), Err(ErrorKind::PacketTooShort)));
        assert!(matches!(a.receive_notify(&[3], t), Err(ErrorKind::PacketTooShort)));
        assert!(matches!(
            a.receive_reliable(&[7, 0, 0], false, t),
            Err(ErrorKind::PacketTooShort)
        ));
        assert!(matches!(a.invalid_fragment(&[8]), Err(ErrorKind::PacketTooShort)));
    }
}
