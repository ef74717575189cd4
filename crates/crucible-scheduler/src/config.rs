//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs shared by the queue and the executor pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the periodic maintenance pass runs when nothing else
    /// triggers it.
    pub maintain_interval: Duration,
    /// Quiet period applied when neither the caller nor the task
    /// specifies one.
    pub default_quiet_period: Duration,
    /// Idle executors re-poll the queue at this pace even without a
    /// wake-up notification.
    pub claim_interval: Duration,
    /// Dead executor slots are detected and replaced at this pace.
    pub watchdog_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            maintain_interval: Duration::from_secs(1),
            default_quiet_period: Duration::ZERO,
            claim_interval: Duration::from_millis(250),
            watchdog_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.default_quiet_period, Duration::ZERO);
        assert!(config.claim_interval < config.maintain_interval);
    }
}
