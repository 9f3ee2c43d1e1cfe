//! Reconnect delays for the streaming connection.
use std::time::{Duration, Instant};

use rand::{thread_rng, Rng};

/// Exponential backoff with jitter and a reset window.
///
/// Each synchronizer owns its own `Backoff`; there is no shared retry state.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter_ratio: f64,
    reset_interval: Duration,
    attempt: u32,
    good_since: Option<Instant>,
}

impl Backoff {
    /// Create a backoff starting at `initial` and capped at `max`. `jitter_ratio` is the largest
    /// fraction of a delay that may be randomly subtracted from it.
    pub fn new(initial: Duration, max: Duration, jitter_ratio: f64, reset_interval: Duration) -> Backoff {
        Backoff {
            initial,
            max,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            reset_interval,
            attempt: 0,
            good_since: None,
        }
    }

    /// Record that a connection was established and is delivering data.
    pub fn mark_good(&mut self) {
        if self.good_since.is_none() {
            self.good_since = Some(Instant::now());
        }
    }

    /// Delay before the next connection attempt.
    ///
    /// If the previous connection stayed healthy for at least the reset interval, the delay
    /// starts over from the initial value.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_at(Instant::now())
    }

    fn next_delay_at(&mut self, now: Instant) -> Duration {
        if let Some(good_since) = self.good_since.take() {
            if now.saturating_duration_since(good_since) >= self.reset_interval {
                self.attempt = 0;
            }
        }

        let delay = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        self.jitter(delay)
    }

    fn base_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.initial.saturating_mul(factor).min(self.max)
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let max_jitter = delay.mul_f64(self.jitter_ratio);
        delay.saturating_sub(thread_rng().gen_range(Duration::ZERO..=max_jitter))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::Backoff;

    fn without_jitter() -> Backoff {
        Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            0.0,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn doubles_until_capped() {
        let mut backoff = without_jitter();

        let delays: Vec<_> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn jitter_only_shortens_delay() {
        let mut backoff = Backoff::new(
            Duration::from_secs(4),
            Duration::from_secs(30),
            0.5,
            Duration::from_secs(60),
        );

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(30), "{delay:?} must be <= max");
        }

        let mut backoff = Backoff::new(
            Duration::from_secs(4),
            Duration::from_secs(30),
            0.5,
            Duration::from_secs(60),
        );
        let first = backoff.next_delay();
        assert!(first >= Duration::from_secs(2) && first <= Duration::from_secs(4));
    }

    #[test]
    fn long_healthy_connection_resets_delay() {
        let mut backoff = without_jitter();
        let start = Instant::now();
        for _ in 0..4 {
            backoff.next_delay_at(start);
        }

        backoff.good_since = Some(start);
        let delay = backoff.next_delay_at(start + Duration::from_secs(61));

        assert_eq!(delay, Duration::from_secs(1));
    }

    #[test]
    fn short_healthy_connection_keeps_growing() {
        let mut backoff = without_jitter();
        let start = Instant::now();
        for _ in 0..3 {
            backoff.next_delay_at(start);
        }

        backoff.good_since = Some(start);
        let delay = backoff.next_delay_at(start + Duration::from_secs(5));

        assert_eq!(delay, Duration::from_secs(8));
    }
}
