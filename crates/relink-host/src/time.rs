use std::time::Instant;

/// Source of the instants fed into the protocol's trackers.
///
/// Every timing decision (connect retries, keep-alives, timeouts, the
/// disconnect grace window) compares against instants drawn from the
/// host's clock rather than calling `Instant::now()` directly. Tests
/// swap in a clock they advance by hand via
/// [`Host::bind_with_config_and_clock`](crate::Host::bind_with_config_and_clock)
/// and drive ticks through `manual_poll`.
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// The default wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_does_not_run_backwards() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
