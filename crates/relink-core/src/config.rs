use std::time::Duration;

use crate::{
    constants::{DEFAULT_MTU, DEFAULT_SEQUENCE_SIZE, MAX_SEQUENCE_SIZE},
    error::{ErrorKind, Result},
};

/// Tunable parameters for a peer and every connection it owns.
///
/// A `Config` is validated once when the peer is created; after that it is
/// treated as read-only. Intervals set to zero disable the corresponding
/// feature (for example a zero `keep_alive_interval` means no keep-alives
/// are ever sent).
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of concurrent connections accepted by this peer.
    /// Connect requests beyond this are rejected without allocating.
    pub max_connections: usize,

    /// How long to wait before re-sending a connect request when the
    /// remote has not replied.
    pub connect_attempt_interval: Duration,

    /// How many connect requests to send before giving up and reporting
    /// a timeout to the application.
    pub max_connect_attempts: u32,

    /// How long a connection may go without receiving any datagram before
    /// it is disconnected with a timeout. Zero disables timeout detection.
    pub timeout_duration: Duration,

    /// How long a disconnected connection is retained before being removed
    /// from the peer's table. During this grace window duplicate teardown
    /// datagrams from the same endpoint are absorbed instead of spawning a
    /// new connection.
    pub disconnect_duration: Duration,

    /// How long a connection may be send-idle before a keep-alive is
    /// emitted. Should be well below `timeout_duration`. Zero disables
    /// keep-alives.
    pub keep_alive_interval: Duration,

    /// Optional key carried inside every connect request and validated by
    /// the receiving peer. `None` accepts any key.
    pub key: Option<String>,

    /// Largest datagram this peer will send, headers included.
    pub mtu: usize,

    /// Bit width of the ack/reliable sequence space. Also sizes the ring
    /// buffers of the reliability engine (`1 << sequence_size` slots).
    /// Maximum 16.
    pub sequence_size: u8,

    /// How many fragments a single reliable message may be split into.
    /// Messages needing more are rejected at send time. Zero disables
    /// fragmentation entirely.
    pub max_reliable_fragments: u8,

    /// Upper bound on unacknowledged reliable packets buffered per
    /// connection. Reaching it makes further reliable sends fail until
    /// acks free space.
    pub max_reliable_packets_in_send_buffer_per_connection: usize,

    /// How long after the last send before a stand-alone ack packet is
    /// emitted when traffic is one-directional.
    pub time_before_empty_ack: Duration,

    /// How many unacknowledged receives trigger an immediate stand-alone
    /// ack, even before `time_before_empty_ack` elapses.
    pub receives_before_empty_ack: u32,

    /// How many stand-alone acks to send in a row before going quiet.
    /// The count resets whenever a new datagram is received.
    pub empty_ack_limit: u32,

    /// Number of datagram buffers pre-allocated per connection.
    pub buffer_pool_start_size: usize,

    /// Maximum number of datagram buffers pooled per connection. Buffers
    /// over this limit are left for the allocator.
    pub buffer_pool_max_size: usize,

    /// OS receive buffer size for the UDP socket. `None` keeps the system
    /// default.
    pub socket_recv_buffer_size: Option<usize>,

    /// OS send buffer size for the UDP socket. `None` keeps the system
    /// default.
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connect_attempt_interval: Duration::from_millis(250),
            max_connect_attempts: 10,
            timeout_duration: Duration::from_secs(10),
            disconnect_duration: Duration::from_secs(1),
            keep_alive_interval: Duration::from_secs(2),
            key: None,
            mtu: DEFAULT_MTU,
            sequence_size: DEFAULT_SEQUENCE_SIZE,
            max_reliable_fragments: 5,
            max_reliable_packets_in_send_buffer_per_connection: 2000,
            time_before_empty_ack: Duration::from_millis(110),
            receives_before_empty_ack: 8,
            empty_ack_limit: 8,
            buffer_pool_start_size: 100,
            buffer_pool_max_size: 5000,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
        }
    }
}

impl Config {
    /// Checks that the configuration is internally consistent.
    ///
    /// Called once at peer construction; an invalid configuration is the
    /// only condition the protocol layer fails fast on.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ErrorKind::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.max_connect_attempts == 0 {
            return Err(ErrorKind::InvalidConfig(
                "max_connect_attempts must be at least 1".into(),
            ));
        }
        if self.connect_attempt_interval.is_zero() {
            return Err(ErrorKind::InvalidConfig(
                "connect_attempt_interval must be greater than zero".into(),
            ));
        }
        if self.sequence_size == 0 || self.sequence_size > MAX_SEQUENCE_SIZE {
            return Err(ErrorKind::InvalidConfig(format!(
                "sequence_size must be between 1 and {}",
                MAX_SEQUENCE_SIZE
            )));
        }
        // Small but workable lower bound: every header plus some payload
        // must fit in one datagram.
        if self.mtu < 64 {
            return Err(ErrorKind::InvalidConfig(
                "mtu must be at least 64 bytes".into(),
            ));
        }
        if self.max_reliable_packets_in_send_buffer_per_connection == 0 {
            return Err(ErrorKind::InvalidConfig(
                "max_reliable_packets_in_send_buffer_per_connection must be at least 1".into(),
            ));
        }
        if !self.keep_alive_interval.is_zero()
            && !self.timeout_duration.is_zero()
            && self.keep_alive_interval >= self.timeout_duration
        {
            return Err(ErrorKind::InvalidConfig(
                "keep_alive_interval must be below timeout_duration".into(),
            ));
        }
        Ok(())
    }

    /// Key bytes carried in connect requests. Empty when no key is set.
    pub fn key_bytes(&self) -> &[u8] {
        self.key.as_deref().map(str::as_bytes).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_connections_rejected() {
        let config = Config { max_connections: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(ErrorKind::InvalidConfig(_))));
    }

    #[test]
    fn test_sequence_size_bounds() {
        let too_big = Config { sequence_size: 17, ..Config::default() };
        assert!(too_big.validate().is_err());

        let zero = Config { sequence_size: 0, ..Config::default() };
        assert!(zero.validate().is_err());

        let max = Config { sequence_size: 16, ..Config::default() };
        assert!(max.validate().is_ok());
    }

    #[test]
    fn test_keep_alive_must_undercut_timeout() {
        let config = Config {
            keep_alive_interval: Duration::from_secs(10),
            timeout_duration: Duration::from_secs(10),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        // zero keep-alive disables the feature and skips the check
        let disabled = Config {
            keep_alive_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_key_bytes() {
        let config = Config { key: Some("v1".into()), ..Config::default() };
        assert_eq!(config.key_bytes(), b"v1");
        assert_eq!(Config::default().key_bytes(), b"");
    }
}
