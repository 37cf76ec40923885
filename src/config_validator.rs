use crate::config::Config;
use crate::error::EventGateError;

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<(), EventGateError> {
        config.ip_limiter().validate()?;
        config.key_limiter().validate()?;
        Self::validate_heartbeat(config)?;
        Self::validate_time_offset(config.time_offset_hours)?;
        Self::validate_api_key(config.api_key.as_deref())?;
        Ok(())
    }

    fn validate_heartbeat(config: &Config) -> Result<(), EventGateError> {
        if config.heartbeat_interval.is_zero() {
            return Err(EventGateError::Configuration(
                "Heartbeat interval must be greater than 0".to_string(),
            ));
        }
        if config.sse_retry.is_zero() {
            return Err(EventGateError::Configuration(
                "SSE retry delay must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Offsets are whole hours within a day either side of UTC.
    pub fn validate_time_offset(hours: i32) -> Result<(), EventGateError> {
        if !(-23..=23).contains(&hours) {
            return Err(EventGateError::Configuration(format!(
                "Time offset must be between -23 and 23 hours, got {hours}"
            )));
        }
        Ok(())
    }

    /// An API key that is set must not be blank.
    pub fn validate_api_key(key: Option<&str>) -> Result<(), EventGateError> {
        match key {
            Some(key) if key.trim().is_empty() => Err(EventGateError::Configuration(
                "API key cannot be empty; leave it unset to refuse writes".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_zero_limit_rejected() {
        let config = Config {
            ip_rate_limit: 0,
            ..Config::default()
        };
        assert!(matches!(
            ConfigValidator::validate(&config),
            Err(EventGateError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_windows_rejected() {
        let config = Config {
            key_rate_window: Duration::ZERO,
            ..Config::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());

        let config = Config {
            ip_sweep_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());

        let config = Config {
            heartbeat_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_time_offset_range() {
        assert!(ConfigValidator::validate_time_offset(7).is_ok());
        assert!(ConfigValidator::validate_time_offset(-23).is_ok());
        assert!(ConfigValidator::validate_time_offset(24).is_err());
    }

    #[test]
    fn test_blank_api_key_rejected() {
        assert!(ConfigValidator::validate_api_key(None).is_ok());
        assert!(ConfigValidator::validate_api_key(Some("k")).is_ok());
        assert!(ConfigValidator::validate_api_key(Some("  ")).is_err());
    }
}
