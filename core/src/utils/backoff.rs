/// Retry backoff schedule
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with up to 20% random jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let raw = self.base.saturating_mul(factor).min(self.max);
        let jitter_ms = (raw.as_millis() as u64) / 5;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        (raw + Duration::from_millis(jitter)).min(self.max)
    }
}
