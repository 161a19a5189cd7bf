//! Adaptive query pacing
//!
//! Each transfer owns one [`RateController`]. It keeps a short window of
//! round-trip samples and a consecutive-failure counter, and derives the
//! delay before the next query:
//!
//! - fast responses move the delay toward the fastest configured pace
//! - ordinary responses pull a backed-off delay back to the base pace
//! - slow responses stretch the delay proportionally
//! - failures double the delay up to the ceiling
//!
//! Nothing here sleeps. Callers ask for a delay and wait on it themselves,
//! so the state machine is testable without a clock.

use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::DripConfig;

/// Latency below which the pace speeds up
pub const FAST_LATENCY: Duration = Duration::from_millis(250);

/// Latency above which the pace slows down
pub const SLOW_LATENCY: Duration = Duration::from_millis(1000);

/// Ceiling on backoff as a multiple of the base delay
pub const MAX_BACKOFF_FACTOR: u32 = 16;

/// Latency samples kept for the moving average
const SAMPLE_WINDOW: usize = 8;

/// Fraction of the distance to the target covered per adjustment
const ADJUST_STEP: f64 = 0.25;

/// Pacing bounds derived from queries-per-minute limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSettings {
    /// Delay at `max_rate_limit`
    pub min_delay: Duration,
    /// Delay at `base_rate_limit`
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    pub adaptive: bool,
    /// Jitter fraction, `None` when disabled
    pub jitter: Option<f64>,
}

impl RateSettings {
    pub fn from_config(config: &DripConfig) -> Self {
        let base_delay = per_minute(config.base_rate_limit);
        Self {
            min_delay: per_minute(config.max_rate_limit).min(base_delay),
            base_delay,
            max_delay: base_delay * MAX_BACKOFF_FACTOR,
            adaptive: config.enable_adaptive_rate,
            jitter: config
                .enable_jitter
                .then_some(config.jitter)
                .filter(|j| *j > 0.0),
        }
    }
}

fn per_minute(queries: u32) -> Duration {
    Duration::from_nanos(60_000_000_000 / queries.max(1) as u64)
}

/// Per-transfer pacing state
#[derive(Debug, Clone)]
pub struct RateController {
    settings: RateSettings,
    current_delay: Duration,
    consecutive_failures: u32,
    samples: VecDeque<Duration>,
}

impl RateController {
    pub fn new(settings: RateSettings) -> Self {
        Self {
            current_delay: settings.base_delay,
            settings,
            consecutive_failures: 0,
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
        }
    }

    pub fn from_config(config: &DripConfig) -> Self {
        Self::new(RateSettings::from_config(config))
    }

    pub fn settings(&self) -> &RateSettings {
        &self.settings
    }

    /// Delay before the next query, without jitter
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Mean of the recent latency window
    pub fn average_latency(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: Duration = self.samples.iter().sum();
        Some(sum / self.samples.len() as u32)
    }

    /// Record a query answered after `latency`
    pub fn record_success(&mut self, latency: Duration) {
        self.consecutive_failures = 0;

        if self.samples.len() >= SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);

        if !self.settings.adaptive {
            self.current_delay = self.settings.base_delay;
            return;
        }

        let avg = self.average_latency().unwrap_or(latency);
        let current = self.current_delay.as_secs_f64();

        let next = if avg < FAST_LATENCY {
            let min = self.settings.min_delay.as_secs_f64();
            current - (current - min).max(0.0) * ADJUST_STEP
        } else if avg > SLOW_LATENCY {
            let over = (avg.as_secs_f64() - SLOW_LATENCY.as_secs_f64()) / SLOW_LATENCY.as_secs_f64();
            current * (1.0 + over.min(1.0) * ADJUST_STEP * 2.0)
        } else {
            let base = self.settings.base_delay.as_secs_f64();
            if current > base {
                current - (current - base) * ADJUST_STEP
            } else {
                current
            }
        };

        self.current_delay = self.clamp(Duration::from_secs_f64(next));
    }

    /// Record a timeout or failed query; backs off exponentially
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current_delay = self.clamp(self.current_delay.saturating_mul(2));
    }

    /// Delay to actually wait, with fresh jitter applied when enabled
    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        match self.settings.jitter {
            Some(jitter) => {
                let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
                self.current_delay.mul_f64(factor)
            }
            None => self.current_delay,
        }
    }

    fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.settings.min_delay, self.settings.max_delay)
    }
}

/// Outcome of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again; `retry` counts from 1
    Retry { retry: u32 },
    /// Retries exhausted after `attempts` total attempts
    GiveUp { attempts: u32 },
}

/// Retry bookkeeping for one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    max_retries: u32,
    retries: u32,
}

impl RetryState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retries: 0,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Advance after a failed attempt, backing off `rate`
    pub fn on_failure(&mut self, rate: &mut RateController) -> RetryDecision {
        rate.record_failure();
        if self.retries >= self.max_retries {
            return RetryDecision::GiveUp {
                attempts: self.retries + 1,
            };
        }
        self.retries += 1;
        RetryDecision::Retry {
            retry: self.retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn settings(adaptive: bool, jitter: Option<f64>) -> RateSettings {
        RateSettings {
            min_delay: Duration::from_millis(400),
            base_delay: Duration::from_millis(800),
            max_delay: Duration::from_millis(12_800),
            adaptive,
            jitter,
        }
    }

    #[test]
    fn test_settings_from_config() {
        let config = DripConfig::default();
        let s = RateSettings::from_config(&config);
        assert_eq!(s.base_delay, Duration::from_millis(800));
        assert_eq!(s.min_delay, Duration::from_millis(400));
        assert_eq!(s.max_delay, Duration::from_millis(12_800));
        assert_eq!(s.jitter, Some(0.2));
    }

    #[test]
    fn test_starts_at_base_delay() {
        let rate = RateController::new(settings(true, None));
        assert_eq!(rate.current_delay(), Duration::from_millis(800));
        assert_eq!(rate.average_latency(), None);
    }

    #[test]
    fn test_fast_responses_speed_up_to_floor() {
        let mut rate = RateController::new(settings(true, None));
        rate.record_success(Duration::from_millis(20));
        let first = rate.current_delay();
        assert!(first < Duration::from_millis(800));

        for _ in 0..100 {
            rate.record_success(Duration::from_millis(20));
        }
        assert!(rate.current_delay() >= Duration::from_millis(400));
        assert!(rate.current_delay() < Duration::from_millis(401));
    }

    #[test]
    fn test_slow_responses_slow_down_to_ceiling() {
        let mut rate = RateController::new(settings(true, None));
        rate.record_success(Duration::from_millis(1500));
        assert!(rate.current_delay() > Duration::from_millis(800));

        for _ in 0..200 {
            rate.record_success(Duration::from_secs(3));
        }
        assert_eq!(rate.current_delay(), Duration::from_millis(12_800));
    }

    #[test]
    fn test_failure_doubles_and_caps() {
        let mut rate = RateController::new(settings(true, None));
        rate.record_failure();
        assert_eq!(rate.current_delay(), Duration::from_millis(1600));
        assert_eq!(rate.consecutive_failures(), 1);
        rate.record_failure();
        assert_eq!(rate.current_delay(), Duration::from_millis(3200));

        for _ in 0..10 {
            rate.record_failure();
        }
        assert_eq!(rate.current_delay(), Duration::from_millis(12_800));
        assert_eq!(rate.consecutive_failures(), 12);
    }

    #[test]
    fn test_success_resets_failures_and_recovers() {
        let mut rate = RateController::new(settings(true, None));
        rate.record_failure();
        rate.record_failure();
        rate.record_success(Duration::from_millis(500));
        assert_eq!(rate.consecutive_failures(), 0);
        // Ordinary latency pulls a backed-off delay toward base
        assert!(rate.current_delay() < Duration::from_millis(3200));
        assert!(rate.current_delay() > Duration::from_millis(800));
    }

    #[test]
    fn test_non_adaptive_returns_to_base() {
        let mut rate = RateController::new(settings(false, None));
        rate.record_failure();
        assert_eq!(rate.current_delay(), Duration::from_millis(1600));
        rate.record_success(Duration::from_millis(5));
        assert_eq!(rate.current_delay(), Duration::from_millis(800));
    }

    #[test]
    fn test_jitter_stays_in_band_and_varies() {
        let rate = RateController::new(settings(true, Some(0.2)));
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<Duration> = (0..50).map(|_| rate.next_delay(&mut rng)).collect();

        for d in &delays {
            assert!(*d >= Duration::from_millis(639));
            assert!(*d <= Duration::from_millis(961));
        }
        assert!(delays.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let rate = RateController::new(settings(true, None));
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(rate.next_delay(&mut rng), Duration::from_millis(800));
    }

    #[test]
    fn test_retry_state_gives_up_after_max_retries() {
        let mut rate = RateController::new(settings(true, None));
        let mut retry = RetryState::new(2);

        assert_eq!(retry.on_failure(&mut rate), RetryDecision::Retry { retry: 1 });
        assert_eq!(retry.on_failure(&mut rate), RetryDecision::Retry { retry: 2 });
        assert_eq!(retry.on_failure(&mut rate), RetryDecision::GiveUp { attempts: 3 });
        assert_eq!(rate.consecutive_failures(), 3);
    }

    #[test]
    fn test_zero_retries() {
        let mut rate = RateController::new(settings(true, None));
        let mut retry = RetryState::new(0);
        assert_eq!(retry.on_failure(&mut rate), RetryDecision::GiveUp { attempts: 1 });
    }
}
