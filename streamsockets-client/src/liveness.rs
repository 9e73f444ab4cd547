//! Liveness Monitor, client side (C4, spec §4.4).
//!
//! The client originates pings; the server only echoes pongs (§4.4's
//! "server-side liveness... does not originate pings" is implemented in
//! `streamsockets-server::handler` as a bare match arm with no timer at
//! all — this module is the asymmetric client-side half that *does* run
//! timers). Folded into `engine::Engine`'s single select loop rather than
//! a separate task, per §9's design note.

use std::time::{Duration, Instant};

pub const MAX_PING_FAILURES: u32 = 5;

#[derive(Debug)]
pub struct LivenessMonitor {
    last_pong: Instant,
    consecutive_failures: u32,
}

impl LivenessMonitor {
    pub fn new() -> Self {
        Self {
            last_pong: Instant::now(),
            consecutive_failures: 0,
        }
    }

    /// Call when the liveness clock should start (handshake completion).
    pub fn reset(&mut self) {
        self.last_pong = Instant::now();
        self.consecutive_failures = 0;
    }

    pub fn on_pong(&mut self) {
        self.last_pong = Instant::now();
        self.consecutive_failures = 0;
    }

    /// Call on the 1s staleness tick. Returns `true` once
    /// `MAX_PING_FAILURES` consecutive stale checks have elapsed, meaning
    /// the caller should close the connection.
    pub fn check_stale(&mut self, timeout: Duration) -> bool {
        if self.last_pong.elapsed() <= timeout {
            return false;
        }
        self.consecutive_failures += 1;
        self.consecutive_failures >= MAX_PING_FAILURES
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_resets_failures() {
        let mut lm = LivenessMonitor::new();
        lm.last_pong = Instant::now() - Duration::from_secs(100);
        assert!(!lm.check_stale(Duration::from_millis(1)));
        lm.consecutive_failures = 3;
        lm.on_pong();
        assert_eq!(lm.consecutive_failures, 0);
    }

    #[test]
    fn closes_after_max_failures() {
        let mut lm = LivenessMonitor::new();
        lm.last_pong = Instant::now() - Duration::from_secs(100);
        let mut closed = false;
        for _ in 0..MAX_PING_FAILURES {
            closed = lm.check_stale(Duration::from_millis(1));
        }
        assert!(closed);
    }

    #[test]
    fn fresh_pong_never_stale() {
        let mut lm = LivenessMonitor::new();
        assert!(!lm.check_stale(Duration::from_secs(10)));
    }
}
