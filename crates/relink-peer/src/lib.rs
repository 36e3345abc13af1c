#![warn(missing_docs)]

//! relink-peer: the per-endpoint connection state machine.
//!
//! A [`Connection`] owns one remote endpoint: its lifecycle state, the four
//! timing trackers that drive handshake retries, keep-alives, timeouts and
//! the disconnect grace window, and the reliability engine for its data
//! traffic. Connections never touch the socket; outgoing datagrams are
//! queued and drained by the peer that owns them.

/// The per-endpoint connection state machine.
pub mod connection;
/// Lifecycle states of a connection.
pub mod connection_state;
/// Events surfaced to the application.
pub mod event;
/// Timers for the connection lifecycle.
pub mod trackers;

pub use connection::Connection;
pub use connection_state::ConnectionState;
pub use event::PeerEvent;
