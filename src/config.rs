use chrono::FixedOffset;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config_validator::ConfigValidator;
use crate::error::EventGateError;
use crate::live_session::SessionConfig;
use crate::rate_limit_config::LimiterConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "eventgate", version, about = "Rate-limited event log with live updates")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Shared secret required on writes; writes are refused when unset
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Writes admitted per client address per window
    #[arg(long, env = "IP_RATE_LIMIT", default_value_t = 5)]
    pub ip_rate_limit: u32,

    #[arg(long, env = "IP_RATE_WINDOW", default_value = "1m", value_parser = humantime::parse_duration)]
    pub ip_rate_window: Duration,

    #[arg(long, env = "IP_SWEEP_INTERVAL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub ip_sweep_interval: Duration,

    /// Writes admitted per API key per window
    #[arg(long, env = "KEY_RATE_LIMIT", default_value_t = 1)]
    pub key_rate_limit: u32,

    #[arg(long, env = "KEY_RATE_WINDOW", default_value = "1m", value_parser = humantime::parse_duration)]
    pub key_rate_window: Duration,

    #[arg(long, env = "KEY_SWEEP_INTERVAL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub key_sweep_interval: Duration,

    /// Keepalive interval on live streams
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "15s", value_parser = humantime::parse_duration)]
    pub heartbeat_interval: Duration,

    /// Reconnect delay advised to stream clients
    #[arg(long, env = "SSE_RETRY", default_value = "3s", value_parser = humantime::parse_duration)]
    pub sse_retry: Duration,

    /// Quiet period that collapses bursts of storage writes into one change
    #[arg(long, env = "CHANGE_DEBOUNCE", default_value = "100ms", value_parser = humantime::parse_duration)]
    pub change_debounce: Duration,

    /// Optional file whose writes also count as data changes
    #[arg(long, env = "WATCH_PATH")]
    pub watch_path: Option<PathBuf>,

    /// Local time offset from UTC, in hours, for calendar views
    #[arg(long, env = "TIME_OFFSET_HOURS", default_value_t = 0, allow_hyphen_values = true)]
    pub time_offset_hours: i32,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            api_key: None,
            ip_rate_limit: 5,
            ip_rate_window: Duration::from_secs(60),
            ip_sweep_interval: Duration::from_secs(3600),
            key_rate_limit: 1,
            key_rate_window: Duration::from_secs(60),
            key_sweep_interval: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(15),
            sse_retry: Duration::from_secs(3),
            change_debounce: Duration::from_millis(100),
            watch_path: None,
            time_offset_hours: 0,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Parse from command line and environment, then validate.
    pub fn load() -> Result<Self, EventGateError> {
        let config = Config::try_parse()
            .map_err(|e| EventGateError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EventGateError> {
        ConfigValidator::validate(self)
    }

    pub fn ip_limiter(&self) -> LimiterConfig {
        LimiterConfig::new(self.ip_rate_limit, self.ip_rate_window, self.ip_sweep_interval)
    }

    pub fn key_limiter(&self) -> LimiterConfig {
        LimiterConfig::new(self.key_rate_limit, self.key_rate_window, self.key_sweep_interval)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            heartbeat: self.heartbeat_interval,
            retry: self.sse_retry,
        }
    }

    pub fn time_offset(&self) -> Result<FixedOffset, EventGateError> {
        FixedOffset::east_opt(self.time_offset_hours * 3600).ok_or_else(|| {
            EventGateError::Configuration(format!(
                "Time offset {}h is out of range",
                self.time_offset_hours
            ))
        })
    }
}
