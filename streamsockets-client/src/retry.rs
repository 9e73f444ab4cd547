//! Retry Controller (C2).
//!
//! Exponential backoff with a cap and reset-on-cap, driven as a plain
//! counter consulted from the reconnect loop's `tokio::select!`, not a
//! generic scheduler abstraction (the loop already *is* the scheduler).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryController {
    attempt: u32,
    initial: Duration,
    cap: Duration,
}

impl RetryController {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            initial,
            cap,
        }
    }

    /// `min(d0 * 2^k, dmax)`, then increments `k`; resets `k` to 0 when the
    /// cap is hit so the sequence repeats instead of staying pinned.
    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(32);
        let scaled_millis = self.initial.as_millis().saturating_mul(1u128 << shift);
        let cap_millis = self.cap.as_millis();
        let delay_millis = scaled_millis.min(cap_millis);

        if delay_millis >= cap_millis {
            self.attempt = 0;
        } else {
            self.attempt += 1;
        }

        Duration::from_millis(delay_millis as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_matches_spec_example() {
        let mut retry = RetryController::new(Duration::from_secs(1), Duration::from_secs(30));
        let millis: Vec<u64> = (0..8).map(|_| retry.next_delay().as_millis() as u64).collect();
        assert_eq!(
            millis,
            vec![1000, 2000, 4000, 8000, 16000, 30000, 1000, 2000]
        );
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut retry = RetryController::new(Duration::from_secs(1), Duration::from_secs(30));
        retry.next_delay();
        retry.next_delay();
        retry.reset();
        assert_eq!(retry.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn cap_is_never_exceeded() {
        let mut retry = RetryController::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..50 {
            assert!(retry.next_delay() <= Duration::from_secs(30));
        }
    }
}
