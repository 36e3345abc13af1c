//! Timers driving the connection lifecycle.
//!
//! Each tracker answers one "is it time to do X" question and records when
//! X last happened. They hold nothing but instants and counters, so each
//! can be tested without a connection around it.

use std::time::{Duration, Instant};

/// Paces connect request retries and counts them against the budget.
#[derive(Debug)]
pub struct ConnectingTracker {
    interval: Duration,
    max_attempts: u32,
    last_attempt: Option<Instant>,
    attempt_count: u32,
}

impl ConnectingTracker {
    /// Creates a tracker that allows `max_attempts` requests spaced
    /// `interval` apart.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self { interval, max_attempts, last_attempt: None, attempt_count: 0 }
    }

    /// Whether enough time has passed to send the next connect request.
    /// True immediately for the first attempt.
    pub fn time_attempt(&self, now: Instant) -> bool {
        match self.last_attempt {
            Some(last) => last + self.interval < now,
            None => true,
        }
    }

    /// Whether the attempt budget is exhausted.
    pub fn max_attempts(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Records that a connect request was sent.
    pub fn on_attempt(&mut self, now: Instant) {
        self.attempt_count += 1;
        self.last_attempt = Some(now);
    }

    /// Number of requests sent so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }
}

/// Detects a connection that has gone silent for too long.
#[derive(Debug)]
pub struct TimeoutTracker {
    duration: Duration,
    last_receive: Instant,
}

impl TimeoutTracker {
    /// Creates a tracker that fires after `duration` without receives.
    /// A zero duration disables timeout detection.
    pub fn new(duration: Duration, now: Instant) -> Self {
        Self { duration, last_receive: now }
    }

    /// Records that a datagram arrived. Any traffic counts as liveness.
    pub fn set_receive_time(&mut self, now: Instant) {
        self.last_receive = now;
    }

    /// Whether the silence exceeded the timeout.
    pub fn time_to_disconnect(&self, now: Instant) -> bool {
        !self.duration.is_zero() && self.last_receive + self.duration < now
    }
}

/// Decides when a send-idle connection needs a keep-alive.
#[derive(Debug)]
pub struct KeepAliveTracker {
    interval: Duration,
    last_send: Instant,
}

impl KeepAliveTracker {
    /// Creates a tracker that fires after `interval` without sends.
    /// A zero interval disables keep-alives.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last_send: now }
    }

    /// Records that a datagram went out, pushing the next keep-alive back.
    pub fn set_send_time(&mut self, now: Instant) {
        self.last_send = now;
    }

    /// Whether the connection has been send-idle long enough.
    pub fn time_to_send(&self, now: Instant) -> bool {
        !self.interval.is_zero() && self.last_send + self.interval < now
    }
}

/// Holds a disconnected connection through its grace window so duplicate
/// teardown datagrams from the endpoint are absorbed instead of spawning a
/// fresh connection.
#[derive(Debug)]
pub struct DisconnectedTracker {
    duration: Duration,
    disconnect_deadline: Option<Instant>,
}

impl DisconnectedTracker {
    /// Creates a tracker with a grace window of `duration`.
    pub fn new(duration: Duration) -> Self {
        Self { duration, disconnect_deadline: None }
    }

    /// Records the disconnect, starting the grace window.
    pub fn on_disconnect(&mut self, now: Instant) {
        self.disconnect_deadline = Some(now + self.duration);
    }

    /// Whether the grace window has elapsed and the connection can be
    /// removed from the peer's table.
    pub fn time_to_remove(&self, now: Instant) -> bool {
        match self.disconnect_deadline {
            Some(deadline) => deadline < now,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_connecting_first_attempt_is_due_immediately() {
        let tracker = ConnectingTracker::new(Duration::from_millis(250), 3);
        assert!(tracker.time_attempt(base()));
    }

    #[test]
    fn test_connecting_attempts_are_spaced() {
        let t = base();
        let mut tracker = ConnectingTracker::new(Duration::from_millis(250), 3);
        tracker.on_attempt(t);
        assert!(!tracker.time_attempt(t + Duration::from_millis(100)));
        assert!(tracker.time_attempt(t + Duration::from_millis(300)));
    }

    #[test]
    fn test_connecting_budget() {
        let t = base();
        let mut tracker = ConnectingTracker::new(Duration::from_millis(250), 3);
        for _ in 0..3 {
            assert!(!tracker.max_attempts());
            tracker.on_attempt(t);
        }
        assert!(tracker.max_attempts());
        assert_eq!(tracker.attempt_count(), 3);
    }

    #[test]
    fn test_timeout_fires_after_silence() {
        let t = base();
        let tracker = TimeoutTracker::new(Duration::from_secs(10), t);
        assert!(!tracker.time_to_disconnect(t + Duration::from_secs(9)));
        assert!(tracker.time_to_disconnect(t + Duration::from_secs(11)));
    }

    #[test]
    fn test_timeout_reset_by_receive() {
        let t = base();
        let mut tracker = TimeoutTracker::new(Duration::from_secs(10), t);
        tracker.set_receive_time(t + Duration::from_secs(9));
        assert!(!tracker.time_to_disconnect(t + Duration::from_secs(18)));
        assert!(tracker.time_to_disconnect(t + Duration::from_secs(20)));
    }

    #[test]
    fn test_timeout_disabled_by_zero_duration() {
        let t = base();
        let tracker = TimeoutTracker::new(Duration::ZERO, t);
        assert!(!tracker.time_to_disconnect(t + Duration::from_secs(3600)));
    }

    #[test]
    fn test_keep_alive_only_when_idle() {
        let t = base();
        let mut tracker = KeepAliveTracker::new(Duration::from_secs(2), t);
        assert!(!tracker.time_to_send(t + Duration::from_secs(1)));
        assert!(tracker.time_to_send(t + Duration::from_secs(3)));

        tracker.set_send_time(t + Duration::from_secs(3));
        assert!(!tracker.time_to_send(t + Duration::from_secs(4)));
    }

    #[test]
    fn test_disconnected_grace_window() {
        let t = base();
        let mut tracker = DisconnectedTracker::new(Duration::from_secs(1));
        assert!(!tracker.time_to_remove(t + Duration::from_secs(3600)));

        tracker.on_disconnect(t);
        assert!(!tracker.time_to_remove(t + Duration::from_millis(500)));
        assert!(tracker.time_to_remove(t + Duration::from_millis(1100)));
    }
}
