//! Resubscribe policy for dropped channels.
//!
//! Exponential backoff with a ceiling and a bounded number of attempts. A
//! successful resubscribe is always followed by a full-list refetch, since
//! anything published while the channel was down is gone.

use std::time::Duration;

use crate::types::settings::RealtimeSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (0-based): `base * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// All delays the policy will wait through before giving up.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(move |attempt| self.delay(attempt))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&RealtimeSettings::default())
    }
}

impl From<&RealtimeSettings> for ReconnectPolicy {
    fn from(settings: &RealtimeSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.reconnect_base_ms),
            max: Duration::from_millis(settings.reconnect_max_ms.max(settings.reconnect_base_ms)),
            max_attempts: settings.reconnect_max_attempts,
        }
    }
}
