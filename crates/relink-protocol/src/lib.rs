#![warn(missing_docs)]

//! relink-protocol: the wire taxonomy and per-connection reliability engine.
//!
//! Every datagram starts with a one byte [`packet::PacketType`]. Command
//! packets carry a sub-type and drive the handshake; data packets carry the
//! sequence/ack header consumed by [`ack::AckSystem`], which turns the lossy
//! datagram channel into unreliable, reliable-ordered and notify delivery.

/// Per-connection reliability engine: acks, retransmission, fragmentation.
pub mod ack;
/// Packet types, commands, reasons and header layout.
pub mod packet;
/// Sequence-indexed ring buffer used by the reliability engine.
pub mod ring_buffer;
/// Wraparound-safe sequence generation and distance.
pub mod sequencer;

pub use ack::{AckSystem, NotifyStatus, NotifyToken, ReliableReceived};
pub use packet::{Command, DisconnectReason, PacketType, RejectReason};
pub use ring_buffer::RingBuffer;
pub use sequencer::Sequencer;
