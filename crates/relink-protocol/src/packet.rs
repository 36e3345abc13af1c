//! Packet taxonomy and header layout.
//!
//! All multi-byte fields are big-endian. Header layouts:
//!
//! - `Command`: `[type u8][command u8][command payload]`
//! - `Unreliable`: `[type u8][payload]`
//! - `Notify`: `[type u8][sequence u16][ack_sequence u16][ack_mask u64][payload]`
//! - `Reliable`: notify header plus `[order u16]`, payload is a batch of
//!   `[len u16][message]` entries
//! - `ReliableFragment`: reliable header, payload is
//!   `[fragment_index u8][slice]` with indices descending across fragments
//! - `Ack` / `NotifyAck`: `[type u8][ack_sequence u16][ack_mask u64]`
//! - `KeepAlive`: `[type u8]`

use relink_core::error::{DecodingErrorKind, ErrorKind};

/// `[type][sequence][ack_sequence][ack_mask]`
pub const SEQUENCE_HEADER_SIZE: usize = 1 + 2 + 2 + 8;
/// Sequence header plus the reliable order number.
pub const RELIABLE_HEADER_SIZE: usize = SEQUENCE_HEADER_SIZE + 2;
/// `[type][ack_sequence][ack_mask]`
pub const ACK_HEADER_SIZE: usize = 1 + 2 + 8;
/// Length prefix in front of each batched reliable message.
pub const RELIABLE_MESSAGE_LENGTH_SIZE: usize = 2;
/// Fragment index byte at the front of a fragment payload.
pub const FRAGMENT_INDEX_SIZE: usize = 1;
/// Smallest valid reliable packet: header plus one length prefix.
pub const MIN_RELIABLE_PACKET_SIZE: usize = RELIABLE_HEADER_SIZE + RELIABLE_MESSAGE_LENGTH_SIZE;
/// Smallest valid fragment packet: header plus the index byte.
pub const MIN_FRAGMENT_PACKET_SIZE: usize = RELIABLE_HEADER_SIZE + FRAGMENT_INDEX_SIZE;
/// `[type][command]`
pub const COMMAND_HEADER_SIZE: usize = 2;

/// Discriminator in the first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Connection control, see [`Command`].
    Command = 1,
    /// Fire-and-forget payload, no tracking.
    Unreliable = 2,
    /// Unreliable payload whose delivery fate is reported to the sender.
    Notify = 3,
    /// Stand-alone ack sent in reply to notify traffic.
    NotifyAck = 4,
    /// Empty packet that only refreshes the remote's timeout timer.
    KeepAlive = 5,
    /// Stand-alone ack carrying the latest receive state.
    Ack = 6,
    /// Sequenced, retransmitted, exactly-once payload batch.
    Reliable = 7,
    /// One slice of a reliable message larger than the MTU.
    ReliableFragment = 8,
}

impl TryFrom<u8> for PacketType {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Command),
            2 => Ok(PacketType::Unreliable),
            3 => Ok(PacketType::Notify),
            4 => Ok(PacketType::NotifyAck),
            5 => Ok(PacketType::KeepAlive),
            6 => Ok(PacketType::Ack),
            7 => Ok(PacketType::Reliable),
            8 => Ok(PacketType::ReliableFragment),
            _ => Err(ErrorKind::DecodingError(DecodingErrorKind::PacketType)),
        }
    }
}

/// Sub-type of a [`PacketType::Command`] packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Client asks to connect; carries the connect key bytes.
    ConnectRequest = 1,
    /// Server accepts the connection.
    ConnectionAccepted = 2,
    /// Server rejects the connection; carries a [`RejectReason`] byte.
    ConnectionRejected = 3,
    /// Either side tears the connection down; carries a
    /// [`DisconnectReason`] byte.
    Disconnect = 4,
}

impl TryFrom<u8> for Command {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::ConnectRequest),
            2 => Ok(Command::ConnectionAccepted),
            3 => Ok(Command::ConnectionRejected),
            4 => Ok(Command::Disconnect),
            _ => Err(ErrorKind::DecodingError(DecodingErrorKind::Command)),
        }
    }
}

/// Why a connect attempt failed, reported to the application exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    /// No reason given.
    None = 0,
    /// The remote peer is at its connection limit.
    ServerFull = 1,
    /// The remote never answered within the attempt budget.
    Timeout = 2,
    /// The connection was cancelled locally while still connecting.
    ClosedByPeer = 3,
    /// The connect key did not match the remote's configured key.
    KeyInvalid = 4,
}

impl TryFrom<u8> for RejectReason {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RejectReason::None),
            1 => Ok(RejectReason::ServerFull),
            2 => Ok(RejectReason::Timeout),
            3 => Ok(RejectReason::ClosedByPeer),
            4 => Ok(RejectReason::KeyInvalid),
            _ => Err(ErrorKind::DecodingError(DecodingErrorKind::RejectReason)),
        }
    }
}

/// Why an established connection ended, reported to the application
/// exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    /// No reason given.
    None = 0,
    /// The local application asked to disconnect.
    RequestedByLocalPeer = 1,
    /// The remote side sent a disconnect command.
    RequestedByRemotePeer = 2,
    /// Nothing was received within the timeout duration.
    Timeout = 3,
    /// The remote violated the protocol (for example an oversized
    /// fragment index).
    InvalidPacket = 4,
}

impl TryFrom<u8> for DisconnectReason {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DisconnectReason::None),
            1 => Ok(DisconnectReason::RequestedByLocalPeer),
            2 => Ok(DisconnectReason::RequestedByRemotePeer),
            3 => Ok(DisconnectReason::Timeout),
            4 => Ok(DisconnectReason::InvalidPacket),
            _ => Err(ErrorKind::DecodingError(DecodingErrorKind::DisconnectReason)),
        }
    }
}
