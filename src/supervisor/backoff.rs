//! Restart backoff and failure accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::types::{BackoffConfig, SupervisorConfig};

/// Uniform value in `[0, 1)` from a shared LCG. Only used to spread restarts,
/// so statistical quality does not matter.
fn next_jitter_unit() -> f64 {
    static STATE: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);
    let mut current = STATE.load(Ordering::Relaxed);
    loop {
        let next = current
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        match STATE.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => {
                // Top 53 bits fill an f64 mantissa.
                #[allow(clippy::cast_precision_loss)]
                return (next >> 11) as f64 / (1u64 << 53) as f64;
            }
            Err(actual) => current = actual,
        }
    }
}

/// Exponential delay: `min(initial * multiplier^(n-1), max)` for the n-th
/// consecutive failure, optionally spread by `±jitter`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            jitter: 0.0,
        }
    }

    /// Spread each delay uniformly over `delay * (1 ± jitter)`.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Delay before the restart that follows the `failures`-th consecutive failure.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs).min(self.max)
    }

    /// [`delay`](Self::delay) with jitter applied, never above `max`.
    pub fn jittered_delay(&self, failures: u32) -> Duration {
        self.spread(self.delay(failures), next_jitter_unit())
    }

    fn spread(&self, base: Duration, unit: f64) -> Duration {
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + unit.mul_add(2.0, -1.0) * self.jitter;
        let secs = (base.as_secs_f64() * factor).max(0.0);
        Duration::from_secs_f64(secs).min(self.max)
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier).with_jitter(config.jitter)
    }
}

/// What the supervisor should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after the delay.
    Retry(Duration),
    /// Give up; carries the consecutive failure count.
    Exhausted(u32),
}

/// Consecutive-failure bookkeeping.
///
/// Failures are counted inside a window that opens with the first failure.
/// A failure arriving after the window has elapsed starts a new count, as does
/// a sustained healthy period (see [`RestartRecord::reset`]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestartRecord {
    pub consecutive_failures: u32,
    pub window_start: Option<Instant>,
    pub last_restart: Option<Instant>,
    pub current_backoff: Duration,
}

impl RestartRecord {
    /// Count one failure and decide whether to restart.
    ///
    /// Up to `max_consecutive_failures` restarts are attempted; the failure
    /// after that exhausts the budget.
    pub fn record_failure(
        &mut self,
        now: Instant,
        policy: &BackoffPolicy,
        config: &SupervisorConfig,
    ) -> RestartDecision {
        if let Some(start) = self.window_start {
            if now.saturating_duration_since(start) > config.failure_window {
                self.reset();
            }
        }
        self.window_start.get_or_insert(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures > config.max_consecutive_failures {
            return RestartDecision::Exhausted(self.consecutive_failures);
        }

        self.current_backoff = policy.jittered_delay(self.consecutive_failures);
        self.last_restart = Some(now);
        RestartDecision::Retry(self.current_backoff)
    }

    /// Forget past failures after the engine has run healthily.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.window_start = None;
        self.current_backoff = Duration::ZERO;
    }
}
