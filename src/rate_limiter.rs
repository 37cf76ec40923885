//! Fixed-window request counting keyed by client identity.
//!
//! Each key owns a [`Visitor`] behind its own lock, so the check-and-increment
//! for one key never contends with another key. The key map itself is a
//! sharded [`DashMap`]; the map is only touched to fetch-or-create a visitor
//! and by the eviction sweep.

use std::borrow::Borrow;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::EventGateError;
use crate::rate_limit_config::LimiterConfig;

/// Identity under which requests are counted: an API credential or a
/// normalized client address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateKey(String);

impl RateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RateKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for RateKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for RateKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Per-key counter state.
#[derive(Debug)]
struct Visitor {
    window_start: Instant,
    count: u32,
    /// Set by the sweep under this visitor's lock once it has been unlinked
    /// from the map; an admit that raced the sweep must re-fetch.
    evicted: bool,
}

impl Visitor {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            evicted: false,
        }
    }
}

/// A window is over only once strictly more than its duration has passed; a
/// request landing exactly on the boundary still counts against it.
fn window_elapsed(window_start: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(window_start) > window
}

fn lock(visitor: &Mutex<Visitor>) -> MutexGuard<'_, Visitor> {
    visitor.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LimiterInner {
    name: &'static str,
    config: LimiterConfig,
    visitors: DashMap<RateKey, Arc<Mutex<Visitor>>>,
    sweeper: CancellationToken,
}

impl Drop for LimiterInner {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

/// Fixed-window limiter shared by cloning; clones observe the same counters.
#[derive(Clone)]
pub struct WindowedLimiter {
    inner: Arc<LimiterInner>,
}

impl fmt::Debug for WindowedLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowedLimiter")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("tracked_keys", &self.inner.visitors.len())
            .finish()
    }
}

impl WindowedLimiter {
    pub fn new(name: &'static str, config: LimiterConfig) -> Result<Self, EventGateError> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(LimiterInner {
                name,
                config,
                visitors: DashMap::new(),
                sweeper: CancellationToken::new(),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.inner.config
    }

    /// Number of keys currently holding a visitor record.
    pub fn tracked_keys(&self) -> usize {
        self.inner.visitors.len()
    }

    /// Count one request for `key`, admitting it unless the key already used
    /// its whole allowance in the current window.
    pub fn admit(&self, key: &str) -> Decision {
        let config = &self.inner.config;

        loop {
            let visitor = self.visitor(key);
            let mut state = lock(&visitor);
            if state.evicted {
                continue;
            }

            let now = Instant::now();
            if window_elapsed(state.window_start, now, config.window) {
                state.count = 0;
                state.window_start = now;
            }

            if state.count >= config.max_count {
                let used = now.saturating_duration_since(state.window_start);
                return Decision::Limited {
                    retry_after: config.window.saturating_sub(used),
                };
            }

            state.count += 1;
            return Decision::Allowed {
                remaining: config.max_count - state.count,
            };
        }
    }

    fn visitor(&self, key: &str) -> Arc<Mutex<Visitor>> {
        if let Some(existing) = self.inner.visitors.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self
            .inner
            .visitors
            .entry(RateKey::new(key))
            .or_insert_with(|| Arc::new(Mutex::new(Visitor::new(Instant::now()))));
        Arc::clone(entry.value())
    }

    /// Remove every visitor whose window has fully elapsed. Visitors whose
    /// lock is currently held are left for the next sweep.
    pub fn sweep(&self) -> usize {
        let window = self.inner.config.window;
        let now = Instant::now();
        let mut removed = 0;

        self.inner.visitors.retain(|_, visitor| {
            let mut state = match visitor.try_lock() {
                Ok(state) => state,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return true,
            };

            if window_elapsed(state.window_start, now, window) {
                state.evicted = true;
                removed += 1;
                false
            } else {
                true
            }
        });

        removed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `shutdown` is
    /// cancelled or the last handle to this limiter is dropped.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let weak: Weak<LimiterInner> = Arc::downgrade(&self.inner);
        let stopped = self.inner.sweeper.clone();
        let name = self.inner.name;
        let every = self.inner.config.sweep_interval;

        tokio::spawn(async move {
            info!(limiter = name, interval = ?every, "Visitor sweep started");

            let mut interval = tokio::time::interval_at(Instant::now() + every, every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = stopped.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let limiter = WindowedLimiter { inner };
                        let removed = limiter.sweep();
                        debug!(
                            limiter = name,
                            removed,
                            remaining = limiter.tracked_keys(),
                            "Swept idle visitors"
                        );
                    }
                }
            }

            info!(limiter = name, "Visitor sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn limiter(max_count: u32, window_secs: u64) -> WindowedLimiter {
        WindowedLimiter::new(
            "test",
            LimiterConfig::new(
                max_count,
                Duration::from_secs(window_secs),
                Duration::from_secs(window_secs * 2),
            ),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_zero_max_count() {
        let config = LimiterConfig::new(0, Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(
            WindowedLimiter::new("bad", config),
            Err(EventGateError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_exactly_max_count_per_window() {
        let limiter = limiter(3, 60);

        assert_eq!(limiter.admit("a"), Decision::Allowed { remaining: 2 });
        assert_eq!(limiter.admit("a"), Decision::Allowed { remaining: 1 });
        assert_eq!(limiter.admit("a"), Decision::Allowed { remaining: 0 });

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            limiter.admit("a"),
            Decision::Limited {
                retry_after: Duration::from_secs(50)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_request_window_scenario() {
        let limiter = limiter(1, 60);

        assert!(limiter.admit("A").is_allowed());
        assert!(!limiter.admit("A").is_allowed());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.admit("A").is_allowed());
        assert!(!limiter.admit("A").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_on_window_boundary_belongs_to_old_window() {
        let limiter = limiter(1, 60);
        assert_eq!(limiter.admit("a"), Decision::Allowed { remaining: 0 });

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!limiter.admit("a").is_allowed());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(limiter.admit("a"), Decision::Allowed { remaining: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_visitor_on_window_boundary() {
        let limiter = limiter(1, 60);
        limiter.admit("a");

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(limiter.sweep(), 0);
        assert_eq!(limiter.tracked_keys(), 1);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_requests_do_not_extend_window() {
        let limiter = limiter(1, 60);
        assert!(limiter.admit("a").is_allowed());

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(10)).await;
            assert!(!limiter.admit("a").is_allowed());
        }

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.admit("a").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = limiter(1, 60);

        assert!(limiter.admit("a").is_allowed());
        assert!(!limiter.admit("a").is_allowed());
        assert!(limiter.admit("b").is_allowed());
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_admission_never_exceeds_limit() {
        let limiter = limiter(10, 3600);
        let keys = ["k0", "k1", "k2", "k3", "k4"];

        let mut handles = Vec::new();
        for worker in 0..128 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut admitted: HashMap<&'static str, u32> = HashMap::new();
                for i in 0..25 {
                    let key = keys[(worker + i) % keys.len()];
                    if limiter.admit(key).is_allowed() {
                        *admitted.entry(key).or_default() += 1;
                    }
                    tokio::task::yield_now().await;
                }
                admitted
            }));
        }

        let mut totals: HashMap<&'static str, u32> = HashMap::new();
        for handle in handles {
            for (key, count) in handle.await.unwrap() {
                *totals.entry(key).or_default() += count;
            }
        }

        for key in keys {
            assert_eq!(totals.get(key).copied().unwrap_or(0), 10, "key {key}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_only_removes_elapsed_windows() {
        let limiter = limiter(2, 60);
        limiter.admit("old");

        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.admit("new");
        assert_eq!(limiter.sweep(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_key_behaves_like_new_key() {
        let limiter = limiter(2, 60);
        assert!(limiter.admit("a").is_allowed());
        assert!(limiter.admit("a").is_allowed());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.sweep(), 1);

        assert_eq!(limiter.admit("a"), Decision::Allowed { remaining: 1 });
        assert_eq!(limiter.admit("a"), Decision::Allowed { remaining: 0 });
        assert!(!limiter.admit("a").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_visitor_handle_is_marked_after_eviction() {
        let limiter = limiter(1, 60);
        limiter.admit("a");
        let stale = limiter.visitor("a");

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.sweep();

        assert!(lock(&stale).evicted);
        let fresh = limiter.visitor("a");
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert!(limiter.admit("a").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_locked_visitor() {
        let limiter = limiter(1, 60);
        limiter.admit("a");
        let held = limiter.visitor("a");

        tokio::time::advance(Duration::from_secs(61)).await;
        let guard = lock(&held);
        assert_eq!(limiter.sweep(), 0);
        drop(guard);
        assert_eq!(limiter.sweep(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_evicts_and_stops() {
        let limiter = limiter(1, 60);
        let shutdown = CancellationToken::new();
        let handle = limiter.spawn_sweeper(shutdown.clone());

        limiter.admit("a");
        tokio::time::sleep(Duration::from_secs(121)).await;
        assert_eq!(limiter.tracked_keys(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop on shutdown")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_stops_with_limiter() {
        let limiter = limiter(1, 60);
        let handle = limiter.spawn_sweeper(CancellationToken::new());

        drop(limiter);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop once the limiter is gone")
            .unwrap();
    }
}
