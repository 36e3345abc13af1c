/// Lifecycle of a connection.
///
/// `Created -> Connecting -> Connected -> Disconnected -> Removing ->
/// Destroyed`, with `Connecting` skipped on the accepting side and
/// `Destroyed` terminal: once reached no sends or receives happen and the
/// peer drops the connection from its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Just allocated, no handshake traffic yet.
    Created,
    /// Sending connect requests, waiting for accept or reject.
    Connecting,
    /// Handshake complete, data may flow.
    Connected,
    /// Torn down, retained for the disconnect grace window.
    Disconnected,
    /// Grace window elapsed, scheduled for eviction.
    Removing,
    /// Evicted. Terminal.
    Destroyed,
}

impl ConnectionState {
    /// Whether data sends are allowed in this state.
    pub fn can_send(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Connecting)
    }

    /// Whether the handshake finished successfully.
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Whether the connection is past its useful life.
    pub fn is_ended(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Removing | ConnectionState::Destroyed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_send() {
        assert!(ConnectionState::Connected.can_send());
        assert!(ConnectionState::Connecting.can_send());
        assert!(!ConnectionState::Created.can_send());
        assert!(!ConnectionState::Disconnected.can_send());
        assert!(!ConnectionState::Destroyed.can_send());
    }

    #[test]
    fn test_is_ended() {
        assert!(!ConnectionState::Connected.is_ended());
        assert!(ConnectionState::Disconnected.is_ended());
        assert!(ConnectionState::Removing.is_ended());
        assert!(ConnectionState::Destroyed.is_ended());
    }
}
