#![warn(missing_docs)]

//! relink-host: peer table, UDP transport and polling host.

/// Peer: demultiplexes one socket across many connections.
pub mod peer;
/// UDP transport, lossy test wrapper and the high-level host.
pub mod socket;
/// Time utilities for the host.
pub mod time;

pub use peer::Peer;
pub use socket::{Host, LinkConditioner, UdpTransport};
pub use time::{Clock, SystemClock};
