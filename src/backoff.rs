//! Exponential backoff with bounded jitter.
//!
//! Shared by the capture stream (reconnects) and the state watcher (poll
//! failures). The jitter keeps many cameras that lost the same switch from
//! retrying in lockstep.

use rand::Rng;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on the exponential part.
    pub cap: Duration,
    /// Upper bound (exclusive) on the random jitter added to every delay.
    pub jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self { base, cap, jitter }
    }

    /// `min(cap, base * 2^(attempt-1))`. Attempt 0 is treated as attempt 1.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let scaled = self.base.saturating_mul(1u32 << exp);
        scaled.min(self.cap)
    }

    /// Exponential delay plus jitter drawn from the thread-local RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        self.exponential(attempt) + self.jitter_with(rng)
    }

    /// Short delay used after a session that was previously established drops.
    pub fn mini_delay(&self) -> Duration {
        self.base.min(self.cap) + self.jitter_with(&mut rand::thread_rng())
    }

    fn jitter_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..max_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
            jitter: Duration::from_millis(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn exponential_part_doubles_until_capped() {
        let backoff = Backoff::default();
        let delays: Vec<Duration> = (1..=8).map(|n| backoff.exponential(n)).collect();
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert_eq!(delays[4], Duration::from_secs(8));
        assert_eq!(delays[7], Duration::from_secs(8));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn jittered_delays_stay_within_bounds() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut previous_floor = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = backoff.delay_with(attempt, &mut rng);
            let floor = backoff.exponential(attempt);
            assert!(floor >= previous_floor);
            assert!(delay >= backoff.base);
            assert!(delay >= floor);
            assert!(delay < backoff.cap + backoff.jitter);
            previous_floor = floor;
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let backoff = Backoff::new(
            Duration::from_millis(500),
            Duration::from_secs(30),
            Duration::ZERO,
        );
        assert_eq!(backoff.exponential(u32::MAX), Duration::from_secs(30));
        assert_eq!(backoff.delay(3), Duration::from_secs(2));
    }
}
