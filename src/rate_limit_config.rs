use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EventGateError;

/// Immutable settings of one fixed-window limiter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests admitted per key within one window.
    pub max_count: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// How often the background sweep evicts idle visitors.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_count: 5,
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

impl LimiterConfig {
    pub fn new(max_count: u32, window: Duration, sweep_interval: Duration) -> Self {
        Self {
            max_count,
            window,
            sweep_interval,
        }
    }

    /// Validate limiter parameters
    pub fn validate(&self) -> Result<(), EventGateError> {
        if self.max_count == 0 {
            return Err(EventGateError::Configuration(
                "Rate limit max count must be greater than 0".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(EventGateError::Configuration(
                "Rate limit window must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(EventGateError::Configuration(
                "Sweep interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
