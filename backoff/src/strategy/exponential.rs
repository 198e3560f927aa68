use std::time::Duration;

use rand::Rng;

/// Exponential backoff: the n-th delay is `base * factor^(n - 1)`, randomized by `jitter` and
/// capped at `max_interval`. With a ceiling set, the iterator ends after that many delays.
///
/// ```
/// use std::time::Duration;
/// use backoff::strategy::exponential::Exponential;
///
/// let delays: Vec<_> = Exponential::from_millis(100, 1_000, 2.0)
///     .with_max_attempts(4)
///     .collect();
/// assert_eq!(
///     delays,
///     vec![
///         Duration::from_millis(100),
///         Duration::from_millis(200),
///         Duration::from_millis(400),
///         Duration::from_millis(800),
///     ]
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    /// Between 0.0 and 1.0; a delay `d` becomes a uniform pick in `[d * (1 - j), d * (1 + j)]`.
    jitter: f64,
    /// None retries forever.
    max_attempts: Option<u16>,
    attempt: u16,
}

impl Exponential {
    pub fn new(base_interval: Duration, max_interval: Duration, factor: f64) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter: 0.0,
            max_attempts: None,
            attempt: 0,
        }
    }

    pub fn from_millis(base_interval_ms: u64, max_interval_ms: u64, factor: f64) -> Self {
        Self::new(
            Duration::from_millis(base_interval_ms),
            Duration::from_millis(max_interval_ms),
            factor,
        )
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u16 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay(&self, attempt: u16) -> Duration {
        // attempt is at least 1 here, so the exponent never goes negative
        let exponent = i32::from(attempt.max(1) - 1);
        let mut delay_ms = self.base_interval.as_millis() as f64 * self.factor.powi(exponent);

        if self.jitter > 0.0 {
            delay_ms *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }

        if !delay_ms.is_finite() {
            return self.max_interval;
        }
        Duration::from_millis(delay_ms as u64).min(self.max_interval)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_attempts) = self.max_attempts
            && self.attempt >= max_attempts
        {
            return None;
        }

        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay(self.attempt))
    }
}
