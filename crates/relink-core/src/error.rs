use std::{fmt, io};

/// Convenience alias for results produced by this workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Errors that can occur while configuring, sending or receiving.
#[derive(Debug)]
pub enum ErrorKind {
    /// An underlying socket operation failed.
    IOError(io::Error),
    /// A received datagram was too short to contain its header.
    PacketTooShort,
    /// A header field could not be decoded into a known value.
    DecodingError(DecodingErrorKind),
    /// A message exceeds the largest size the connection can send.
    MessageTooLarge {
        /// Size of the rejected message in bytes.
        size: usize,
        /// Largest size the send path accepts.
        max: usize,
    },
    /// The per-connection buffer of unacknowledged packets is full.
    SendBufferFull,
    /// The operation requires an established or connecting connection.
    NotConnected,
    /// There is no connection for the given address.
    UnknownConnection,
    /// A configuration value failed validation.
    InvalidConfig(String),
}

/// The header field that failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodingErrorKind {
    /// The leading packet type byte.
    PacketType,
    /// The command sub-type byte.
    Command,
    /// The reject reason byte of a connection-rejected command.
    RejectReason,
    /// The reason byte of a disconnect command.
    DisconnectReason,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::IOError(e) => write!(f, "socket error: {}", e),
            ErrorKind::PacketTooShort => {
                write!(f, "received data too short to contain a header")
            }
            ErrorKind::DecodingError(field) => {
                write!(f, "could not decode field: {}", field)
            }
            ErrorKind::MessageTooLarge { size, max } => {
                write!(f, "message of {} bytes exceeds the max of {} bytes", size, max)
            }
            ErrorKind::SendBufferFull => {
                write!(f, "send buffer of unacknowledged packets is full")
            }
            ErrorKind::NotConnected => write!(f, "connection is not connected"),
            ErrorKind::UnknownConnection => {
                write!(f, "no connection exists for the given address")
            }
            ErrorKind::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl fmt::Display for DecodingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodingErrorKind::PacketType => write!(f, "packet type"),
            DecodingErrorKind::Command => write!(f, "command"),
            DecodingErrorKind::RejectReason => write!(f, "reject reason"),
            DecodingErrorKind::DisconnectReason => write!(f, "disconnect reason"),
        }
    }
}

impl std::error::Error for ErrorKind {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ErrorKind::IOError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(inner: io::Error) -> Self {
        ErrorKind::IOError(inner)
    }
}
