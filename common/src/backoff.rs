//! Exponential backoff with jitter for worker reconnect loops.

use rand::Rng;
use std::time::Duration;

/// Tracks the current retry attempt for one connection and computes the
/// next delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            cap,
        }
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt += 1;
        let unjittered = self.base.saturating_mul(1u32 << exp).min(self.cap);
        let jitter_frac: f64 = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_secs_f64(unjittered.as_secs_f64() * jitter_frac)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_but_stays_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(100));
        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(100));
            previous = delay;
        }
        let _ = previous;
    }

    #[test]
    fn reset_restarts_from_the_base_delay() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        assert!(backoff.attempt() >= 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
