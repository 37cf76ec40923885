use std::time::SystemTime;
use serde::{Deserialize, Serialize};

use crate::change_watcher::ChangeWatcher;
use crate::metrics::{AdmissionMetrics, AdmissionSnapshot};
use crate::rate_limit_config::LimiterConfig;
use crate::rate_limiter::WindowedLimiter;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub live_sessions: usize,
    pub limiters: Vec<LimiterStatus>,
    pub admission: AdmissionSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LimiterStatus {
    pub name: String,
    pub tracked_keys: usize,
    pub config: LimiterConfig,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

#[derive(Clone)]
pub struct HealthChecker {
    watcher: ChangeWatcher,
    limiters: Vec<WindowedLimiter>,
    metrics: AdmissionMetrics,
}

impl HealthChecker {
    pub fn new(watcher: ChangeWatcher, limiters: Vec<WindowedLimiter>, metrics: AdmissionMetrics) -> Self {
        // Pin the start time to construction rather than the first probe.
        let _ = *START_TIME;
        Self {
            watcher,
            limiters,
            metrics,
        }
    }

    pub fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        HealthStatus {
            status: "healthy".to_string(),
            timestamp: now.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            live_sessions: self.watcher.subscriber_count(),
            limiters: self
                .limiters
                .iter()
                .map(|limiter| LimiterStatus {
                    name: limiter.name().to_string(),
                    tracked_keys: limiter.tracked_keys(),
                    config: *limiter.config(),
                })
                .collect(),
            admission: self.metrics.snapshot(),
        }
    }
}
