#![warn(missing_docs)]

//! relink-core: configuration, error types, buffer pooling and the raw
//! datagram transport trait shared by the rest of the workspace.

/// Configuration values for a peer and its connections.
pub mod config;
/// Error types used across the workspace.
pub mod error;
/// Reusable byte-buffer pool.
pub mod pool;
/// Raw datagram socket abstraction.
pub mod transport;

/// Constants shared across the workspace.
pub mod constants {
    /// Default maximum datagram size in bytes.
    ///
    /// Chosen to fit within a 1500 byte ethernet MTU after IP and UDP
    /// headers, with some slack for tunnelling overhead.
    pub const DEFAULT_MTU: usize = 1452;

    /// Default bit width of the ack/reliable sequence space.
    pub const DEFAULT_SEQUENCE_SIZE: u8 = 12;

    /// Maximum bit width of the sequence space (sequences are u16 on the wire).
    pub const MAX_SEQUENCE_SIZE: u8 = 16;
}

pub use config::Config;
pub use error::{DecodingErrorKind, ErrorKind, Result};
pub use pool::BufferPool;
pub use transport::Socket;
