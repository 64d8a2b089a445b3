use std::time::Duration;

/// Exponential backoff: `min(base * 2^retry, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before attempt number `retry` (already incremented for the
    /// failure being handled). Saturates at `max` instead of overflowing.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Final delay of a failed record: per-event backoff plus tenant penalty.
/// The penalty is added on top and is not bounded by the backoff cap.
pub fn compose_delay(backoff: Duration, tenant_penalty: Duration) -> Duration {
    backoff.saturating_add(tenant_penalty)
}
