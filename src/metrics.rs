use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub admitted: u64,
    pub rate_limited: u64,
    pub credential_rejected: u64,
    pub since: u64,
}

#[derive(Debug)]
struct Counters {
    admitted: AtomicU64,
    rate_limited: AtomicU64,
    credential_rejected: AtomicU64,
    since: u64,
}

/// Lock-free counters of admission outcomes, shared by cloning.
#[derive(Debug, Clone)]
pub struct AdmissionMetrics {
    counters: Arc<Counters>,
}

impl Default for AdmissionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters {
                admitted: AtomicU64::new(0),
                rate_limited: AtomicU64::new(0),
                credential_rejected: AtomicU64::new(0),
                since: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            }),
        }
    }

    pub fn record_admitted(&self) {
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_credential_rejected(&self) {
        self.counters.credential_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        AdmissionSnapshot {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            credential_rejected: self.counters.credential_rejected.load(Ordering::Relaxed),
            since: self.counters.since,
        }
    }
}
