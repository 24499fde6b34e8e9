use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use super::config::RetryConfig;

/// Multiplicative jitter applied to every computed delay.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JitterBand {
    low: f64,
    high: f64,
}

impl JitterBand {
    pub const DEFAULT: JitterBand = JitterBand {
        low: 0.75,
        high: 1.25,
    };

    /// Returns `None` unless `0 < low <= high`.
    pub fn new(low: f64, high: f64) -> Option<Self> {
        (low.is_finite() && high.is_finite() && low > 0.0 && low <= high)
            .then_some(Self { low, high })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.low == self.high {
            self.low
        } else {
            rng.random_range(self.low..=self.high)
        }
    }
}

/// Why a failed job will not be retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustReason {
    /// The handler reported a failure that retrying cannot fix.
    Terminal,
    /// The attempt budget is spent.
    AttemptsExhausted,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        retry_at: DateTime<Utc>,
    },
    Exhausted(ExhaustReason),
}

/// Exponential backoff with jitter.
///
/// The n-th failure (1-based attempt number) waits
/// `base * 2^(n-1) * jitter`, capped at `max_delay`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: JitterBand,
}

impl RetryPolicy {
    const MIN_DELAY: Duration = Duration::from_millis(1);

    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay: Duration::from_secs(6 * 60 * 60),
            max_attempts,
            jitter: JitterBand::DEFAULT,
        }
    }

    /// Build from config, ignoring an invalid jitter band. The catalog rejects
    /// invalid bands before a policy is ever built from them.
    pub fn from_config(config: &RetryConfig) -> Self {
        let jitter = JitterBand::new(config.jitter_low, config.jitter_high)
            .unwrap_or(JitterBand::DEFAULT);
        Self::new(config.backoff_base(), config.max_attempts)
            .with_max_delay(config.backoff_max())
            .with_jitter(jitter)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterBand) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> JitterBand {
        self.jitter
    }

    fn scaled(&self, attempt: u32, factor: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(62) as i32;
        let secs = self.base.as_secs_f64() * 2f64.powi(exponent) * factor;
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped)
            .unwrap_or(self.max_delay)
            .max(Self::MIN_DELAY)
    }

    /// Retry delay after the given attempt failed.
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let factor = self.jitter.sample(rng);
        self.scaled(attempt, factor)
    }

    /// Same as [`RetryPolicy::delay_for`] with a reproducible random source.
    pub fn delay_with_seed(&self, attempt: u32, seed: u64) -> Duration {
        let mut rng = StdRng::seed_from_u64(seed);
        self.delay_for(attempt, &mut rng)
    }

    /// Inclusive window every delay for `attempt` falls into.
    pub fn band(&self, attempt: u32) -> (Duration, Duration) {
        (
            self.scaled(attempt, self.jitter.low),
            self.scaled(attempt, self.jitter.high),
        )
    }

    /// Decide what happens to a job whose `attempt`-th execution failed at
    /// `failed_at`.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        retryable: bool,
        failed_at: DateTime<Utc>,
        rng: &mut R,
    ) -> RetryDecision {
        if !retryable {
            return RetryDecision::Exhausted(ExhaustReason::Terminal);
        }
        if attempt >= self.max_attempts {
            return RetryDecision::Exhausted(ExhaustReason::AttemptsExhausted);
        }

        let delay = self.delay_for(attempt, rng);
        let retry_at = TimeDelta::from_std(delay)
            .ok()
            .and_then(|delta| failed_at.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Retry { delay, retry_at }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(d: Duration) -> f64 {
        d.as_secs_f64()
    }

    #[test]
    fn thirty_second_base_follows_documented_bands() {
        let policy = RetryPolicy::new(Duration::from_secs(30), 5);
        let expected = [
            (22.5, 37.5),
            (45.0, 75.0),
            (90.0, 150.0),
            (180.0, 300.0),
            (360.0, 600.0),
        ];

        for seed in 0..200u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            for (index, (low, high)) in expected.iter().enumerate() {
                let attempt = index as u32 + 1;
                let delay = secs(policy.delay_for(attempt, &mut rng));
                assert!(
                    delay >= *low - 1e-9 && delay <= *high + 1e-9,
                    "attempt {attempt} seed {seed}: {delay}s outside [{low}, {high}]"
                );
            }
        }

        let (low, high) = policy.band(3);
        assert_eq!(secs(low), 90.0);
        assert_eq!(secs(high), 150.0);
    }

    #[test]
    fn same_seed_gives_same_delay() {
        let policy = RetryPolicy::new(Duration::from_secs(30), 5);
        for attempt in 1..=5 {
            assert_eq!(
                policy.delay_with_seed(attempt, 42),
                policy.delay_with_seed(attempt, 42)
            );
        }

        let distinct: std::collections::HashSet<_> = (0..32u64)
            .map(|seed| policy.delay_with_seed(1, seed))
            .collect();
        assert!(distinct.len() > 1, "jitter should vary across seeds");
    }

    #[test]
    fn decide_exhausts_at_max_attempts() {
        let policy = RetryPolicy::new(Duration::from_secs(30), 5);
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 1..5 {
            match policy.decide(attempt, true, now, &mut rng) {
                RetryDecision::Retry { retry_at, delay } => {
                    assert!(retry_at > now);
                    assert!(delay > Duration::ZERO);
                }
                other => panic!("attempt {attempt} should retry, got {other:?}"),
            }
        }

        assert_eq!(
            policy.decide(5, true, now, &mut rng),
            RetryDecision::Exhausted(ExhaustReason::AttemptsExhausted)
        );
    }

    #[test]
    fn terminal_failures_never_retry() {
        let policy = RetryPolicy::new(Duration::from_secs(30), 5);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            policy.decide(1, false, Utc::now(), &mut rng),
            RetryDecision::Exhausted(ExhaustReason::Terminal)
        );
    }

    #[test]
    fn delay_is_capped_and_never_zero() {
        let policy = RetryPolicy::new(Duration::from_secs(30), 100)
            .with_max_delay(Duration::from_secs(600));
        assert_eq!(policy.delay_with_seed(40, 3), Duration::from_secs(600));

        let tiny = RetryPolicy::new(Duration::ZERO, 3);
        assert!(tiny.delay_with_seed(1, 3) >= Duration::from_millis(1));
    }

    #[test]
    fn rejects_inverted_jitter_band() {
        assert!(JitterBand::new(1.25, 0.75).is_none());
        assert!(JitterBand::new(0.0, 1.0).is_none());
        assert!(JitterBand::new(1.0, 1.0).is_some());
    }
}
