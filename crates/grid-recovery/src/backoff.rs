//! Retry delays of a responder that cannot reach the recovery server.

use std::time::Duration;

use rand::Rng;

/// How a responder retries reaching the recovery server.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry. Default: 1 s.
    pub initial_delay: Duration,
    /// Growth factor of the delay after every failed attempt. Default: 2.
    pub backoff_multiplier: f64,
    /// Upper bound of any delay. Default: 30 s.
    pub max_delay: Duration,
    /// Retries before giving up. Default: 20.
    pub max_attempts: u32,
    /// Relative jitter in `0.0..=1.0`, applied as ±jitter. Default: 0.25.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 20,
            jitter: 0.25,
        }
    }
}

impl ReconnectConfig {
    /// The delays to sleep before each retry, `max_attempts` of them.
    pub fn delays(&self) -> Backoff {
        Backoff {
            base: self.initial_delay.min(self.max_delay),
            remaining: self.max_attempts,
            config: self.clone(),
        }
    }
}

/// Finite sequence of growing, jittered delays. See [`ReconnectConfig::delays`].
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    base: Duration,
    remaining: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.remaining = self.remaining.checked_sub(1)?;
        let delay = jittered(self.base, self.config.jitter).min(self.config.max_delay);
        self.base = self
            .base
            .mul_f64(self.config.backoff_multiplier.max(1.0))
            .min(self.config.max_delay);
        Some(delay)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining as usize;
        (remaining, Some(remaining))
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let spread = jitter.min(1.0);
    delay.mul_f64(rand::rng().random_range((1.0 - spread)..=(1.0 + spread)))
}
