//! Reconnect backoff policy.
//!
//! Exponential delay with a capped ceiling and a small random jitter so a
//! fleet of clients dropped by the same relay restart out of phase.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt-1)`, capped, plus up to 10% jitter.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// The delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(1u32 << exp);
        let capped = raw.min(self.cap);
        capped + self.jitter(capped)
    }

    fn jitter(&self, of: Duration) -> Duration {
        let max_jitter = of.as_millis() as u64 / 10;
        if max_jitter == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_jitter))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(300),
            cap: Duration::from_secs(5),
        }
    }
}
