use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnect schedule for unexpected closes.
///
/// The delay before attempt `k` (1-based) is `base_delay_ms * 2^(k-1)`,
/// clamped to `max_delay_ms`. No attempt beyond `max_attempts` is made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Number of attempts before giving up and staying disconnected.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Returns the delay to wait before `attempt`, or `None` once the cap is
    /// exceeded (or for the meaningless attempt `0`).
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        // 2^63 already overflows any sane base; saturate instead of wrapping.
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}
