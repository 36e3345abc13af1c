#![warn(missing_docs)]

//! Relink: a small public API facade for the workspace.
//!
//! This crate provides a clean, stable surface that re-exports the most
//! commonly used types for reliable messaging over UDP:
//!
//! - Host and events (`Host`, `PeerEvent`)
//! - Notify delivery tokens (`NotifyToken`, `NotifyStatus`)
//! - Core configuration and errors (`Config`, `ErrorKind`)
//!
//! Example
//! ```no_run
//! use relink::{Host, PeerEvent};
//! use std::time::Instant;
//!
//! let mut server = Host::bind("127.0.0.1:9000").unwrap();
//!
//! loop {
//!     server.manual_poll(Instant::now());
//!     while let Some(event) = server.recv() {
//!         match event {
//!             PeerEvent::Connected { addr } => println!("{} connected", addr),
//!             PeerEvent::Data { addr, payload } => {
//!                 // echo back with guaranteed delivery
//!                 server.send_reliable(addr, &payload).unwrap();
//!             }
//!             PeerEvent::ConnectionFailed { .. } => {}
//!             PeerEvent::Disconnected { addr, .. } => println!("{} left", addr),
//!         }
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(1));
//! }
//! ```

// Core config and errors
pub use relink_core::{
    config::Config,
    error::{ErrorKind, Result},
};
// Host: one socket, many connections
pub use relink_host::{Clock, Host, LinkConditioner, SystemClock, UdpTransport};
// Connection events
pub use relink_peer::{ConnectionState, PeerEvent};
// Protocol: delivery fates and wire enums
pub use relink_protocol::{
    ack::{NotifyStatus, NotifyToken},
    packet::{DisconnectReason, RejectReason},
};

/// Convenience prelude with the most commonly used items.
pub mod prelude {
    pub use crate::{
        Config, DisconnectReason, ErrorKind, Host, NotifyStatus, NotifyToken, PeerEvent,
        RejectReason,
    };
}
