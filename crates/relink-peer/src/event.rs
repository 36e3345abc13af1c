use std::net::SocketAddr;

use relink_protocol::packet::{DisconnectReason, RejectReason};

/// Events surfaced from the peer's tick loop to the application.
///
/// Terminal events fire exactly once per connection: a connection produces
/// either one `Connected` eventually followed by one `Disconnected`, or a
/// single `ConnectionFailed`. All three delivery modes surface payloads as
/// `Data`; notify fates are reported through the token returned at send
/// time instead of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The handshake with `addr` completed.
    Connected {
        /// Remote endpoint.
        addr: SocketAddr,
    },
    /// A connect attempt to `addr` failed; no connection exists.
    ConnectionFailed {
        /// Remote endpoint.
        addr: SocketAddr,
        /// Why the attempt failed.
        reason: RejectReason,
    },
    /// The established connection to `addr` ended.
    Disconnected {
        /// Remote endpoint.
        addr: SocketAddr,
        /// Why the connection ended.
        reason: DisconnectReason,
    },
    /// A payload arrived from `addr`.
    Data {
        /// Remote endpoint.
        addr: SocketAddr,
        /// The payload bytes, reassembled and in order for reliable
        /// traffic.
        payload: Vec<u8>,
    },
}
