//! Exponential backoff policy shared by image descriptions and webhooks.
//!
//! The policy only computes delays. Callers own the attempt ceiling and the
//! sleep itself, so the description scheduler can sleep *outside* its pool
//! slot and the webhook notifier can give up on its own terms.

use rand::Rng;
use std::time::Duration;

/// Largest exponent applied to the base delay. `2^16` × a one-second base is
/// already ~18 hours; anything beyond that is a misconfiguration.
const MAX_EXPONENT: u32 = 16;

/// Exponential backoff: `base_delay * 2^attempt`, optionally jittered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            jitter: false,
        }
    }

    pub fn from_millis(base_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms))
    }

    /// Add up to 50 % random extra delay on top of [`RetryPolicy::delay`].
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic delay before retry number `attempt` (0-based).
    ///
    /// With a 1 s base: 1 s → 2 s → 4 s → …
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_EXPONENT);
        self.base_delay.saturating_mul(factor)
    }

    /// Delay actually slept by callers: [`RetryPolicy::delay`] plus jitter
    /// when enabled.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let max_extra = delay.as_millis() as u64 / 2;
        let extra = rand::thread_rng().gen_range(0..=max_extra);
        delay + Duration::from_millis(extra)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_millis(1000)
    }
}
