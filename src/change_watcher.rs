//! Turns raw storage notifications into a coalesced "something changed"
//! signal fanned out to every live session.
//!
//! The signal is a single `watch` slot: a subscriber that has not yet looked
//! at the last change sees any number of further changes as one. Dropping a
//! [`ChangeSubscription`] is all it takes to unregister.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EventGateError;

/// Payload-less change signal; `seq` and `at` exist for logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub seq: u64,
    pub at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ContentWrite,
    MetadataOnly,
    Other,
}

/// One raw notification from a storage adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub origin: String,
}

impl Notification {
    pub fn content_write(origin: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::ContentWrite,
            origin: origin.into(),
        }
    }

    pub fn is_relevant(&self) -> bool {
        self.kind == NotificationKind::ContentWrite
    }
}

/// Producer of raw notifications. `None` means the source is exhausted.
#[async_trait]
pub trait ChangeSource: Send {
    fn name(&self) -> String;

    async fn next_notification(&mut self) -> Option<Notification>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("change watcher is gone")]
pub struct WatcherClosed;

/// A single subscriber's view of the change signal.
#[derive(Debug)]
pub struct ChangeSubscription {
    rx: watch::Receiver<ChangeEvent>,
}

impl ChangeSubscription {
    /// Wait for a change not yet seen by this subscriber and mark it seen.
    /// Cancel safe.
    pub async fn changed(&mut self) -> Result<ChangeEvent, WatcherClosed> {
        self.rx.changed().await.map_err(|_| WatcherClosed)?;
        Ok(*self.rx.borrow_and_update())
    }

    pub fn has_pending(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct ChangeWatcher {
    sender: Arc<watch::Sender<ChangeEvent>>,
    debounce: Duration,
}

impl ChangeWatcher {
    pub fn new(debounce: Duration) -> Self {
        let (sender, _) = watch::channel(ChangeEvent {
            seq: 0,
            at: SystemTime::now(),
        });

        Self {
            sender: Arc::new(sender),
            debounce,
        }
    }

    /// Register a subscriber. Changes published before this call are not
    /// reported to it.
    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription {
            rx: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Signal every current subscriber. Works with no subscribers at all.
    pub fn publish(&self) -> ChangeEvent {
        self.sender.send_modify(|event| {
            event.seq += 1;
            event.at = SystemTime::now();
        });
        *self.sender.borrow()
    }

    /// Forward relevant notifications from `source` until it ends or
    /// `shutdown` fires.
    pub fn spawn_listener<S>(&self, mut source: S, shutdown: CancellationToken) -> JoinHandle<()>
    where
        S: ChangeSource + 'static,
    {
        let watcher = self.clone();

        tokio::spawn(async move {
            let name = source.name();
            info!(source = %name, "Change listener started");

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = source.next_notification() => next,
                };
                let Some(notification) = next else {
                    info!(source = %name, "Change source closed");
                    break;
                };

                if !notification.is_relevant() {
                    debug!(
                        source = %name,
                        origin = %notification.origin,
                        kind = ?notification.kind,
                        "Ignoring notification"
                    );
                    continue;
                }

                if !watcher.debounce.is_zero()
                    && !drain_burst(&mut source, watcher.debounce, &shutdown).await
                {
                    break;
                }

                let event = watcher.publish();
                debug!(
                    source = %name,
                    seq = event.seq,
                    subscribers = watcher.subscriber_count(),
                    "Change published"
                );
            }

            info!(source = %name, "Change listener stopped");
        })
    }
}

/// Swallow whatever arrives within `window` after a relevant notification.
/// Returns `false` if shutdown interrupted the wait.
async fn drain_burst<S: ChangeSource>(
    source: &mut S,
    window: Duration,
    shutdown: &CancellationToken,
) -> bool {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return true,
            _ = shutdown.cancelled() => return false,
            next = source.next_notification() => {
                if next.is_none() {
                    return true;
                }
            }
        }
    }
}

/// Commit hook handed to the store; every successful mutation calls
/// [`content_written`](Self::content_written).
#[derive(Debug, Clone)]
pub struct StoreNotifier {
    tx: mpsc::Sender<Notification>,
    origin: Arc<str>,
}

impl StoreNotifier {
    pub fn content_written(&self) {
        match self.tx.try_send(Notification::content_write(self.origin.as_ref())) {
            // A full queue already holds a content write, which covers this one.
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(origin = %self.origin, "No change listener attached");
            }
        }
    }
}

/// In-process change source fed by a [`StoreNotifier`].
#[derive(Debug)]
pub struct ChannelChangeSource {
    rx: mpsc::Receiver<Notification>,
    origin: Arc<str>,
}

pub fn commit_channel(origin: &str, capacity: usize) -> (StoreNotifier, ChannelChangeSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let origin: Arc<str> = Arc::from(origin);

    (
        StoreNotifier {
            tx,
            origin: Arc::clone(&origin),
        },
        ChannelChangeSource { rx, origin },
    )
}

#[async_trait]
impl ChangeSource for ChannelChangeSource {
    fn name(&self) -> String {
        format!("commit:{}", self.origin)
    }

    async fn next_notification(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

/// Filesystem adapter: watches one file for writes.
pub struct FileChangeSource {
    path: PathBuf,
    rx: mpsc::Receiver<Notification>,
    _watcher: RecommendedWatcher,
}

impl FileChangeSource {
    pub fn watch(path: impl AsRef<Path>) -> Result<Self, EventGateError> {
        let path = path.as_ref().to_path_buf();
        let origin = path.display().to_string();
        let (tx, rx) = mpsc::channel(64);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let notification = Notification {
                        kind: classify(&event.kind),
                        origin: origin.clone(),
                    };
                    // Runs on the watcher's own thread.
                    if tx.blocking_send(notification).is_err() {
                        debug!(origin = %origin, "File change listener gone");
                    }
                }
                Err(e) => warn!(error = %e, "File watch error"),
            }
        })?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        info!(path = %path.display(), "Watching file for changes");
        Ok(Self {
            path,
            rx,
            _watcher: watcher,
        })
    }
}

#[async_trait]
impl ChangeSource for FileChangeSource {
    fn name(&self) -> String {
        format!("file:{}", self.path.display())
    }

    async fn next_notification(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

fn classify(kind: &EventKind) -> NotificationKind {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => NotificationKind::MetadataOnly,
        EventKind::Modify(_) | EventKind::Create(_) => NotificationKind::ContentWrite,
        _ => NotificationKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind};
    use tokio_test::{assert_pending, assert_ready};

    /// Source fed directly by the test, with any notification kind.
    struct ScriptedSource {
        rx: mpsc::UnboundedReceiver<Notification>,
    }

    #[async_trait]
    impl ChangeSource for ScriptedSource {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        async fn next_notification(&mut self) -> Option<Notification> {
            self.rx.recv().await
        }
    }

    fn scripted() -> (mpsc::UnboundedSender<Notification>, ScriptedSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, ScriptedSource { rx })
    }

    fn note(kind: NotificationKind) -> Notification {
        Notification {
            kind,
            origin: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let watcher = ChangeWatcher::new(Duration::ZERO);
        assert_eq!(watcher.publish().seq, 1);
        assert_eq!(watcher.publish().seq, 2);
    }

    #[tokio::test]
    async fn test_burst_coalesces_for_slow_subscriber() {
        let watcher = ChangeWatcher::new(Duration::ZERO);
        let mut sub = watcher.subscribe();

        watcher.publish();
        watcher.publish();
        watcher.publish();

        assert_eq!(sub.changed().await.unwrap().seq, 3);

        let mut next = tokio_test::task::spawn(sub.changed());
        assert_pending!(next.poll());
        watcher.publish();
        assert!(next.is_woken());
        assert_eq!(assert_ready!(next.poll()).unwrap().seq, 4);
    }

    #[tokio::test]
    async fn test_subscription_ignores_earlier_changes() {
        let watcher = ChangeWatcher::new(Duration::ZERO);
        watcher.publish();

        let sub = watcher.subscribe();
        assert!(!sub.has_pending());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unregisters() {
        let watcher = ChangeWatcher::new(Duration::ZERO);
        let first = watcher.subscribe();
        let second = watcher.subscribe();
        assert_eq!(watcher.subscriber_count(), 2);

        drop(first);
        watcher.publish();
        assert_eq!(watcher.subscriber_count(), 1);
        drop(second);
        assert_eq!(watcher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_sees_close_when_watcher_dropped() {
        let watcher = ChangeWatcher::new(Duration::ZERO);
        let mut sub = watcher.subscribe();
        drop(watcher);
        assert_eq!(sub.changed().await, Err(WatcherClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_filters_irrelevant_notifications() {
        let watcher = ChangeWatcher::new(Duration::ZERO);
        let mut sub = watcher.subscribe();
        let (tx, source) = scripted();
        let shutdown = CancellationToken::new();
        let handle = watcher.spawn_listener(source, shutdown.clone());

        tx.send(note(NotificationKind::MetadataOnly)).unwrap();
        tx.send(note(NotificationKind::Other)).unwrap();
        let quiet = tokio::time::timeout(Duration::from_secs(1), sub.changed()).await;
        assert!(quiet.is_err(), "metadata-only touch must not publish");

        tx.send(note(NotificationKind::ContentWrite)).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), sub.changed())
            .await
            .expect("content write should publish")
            .unwrap();
        assert_eq!(event.seq, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_debounces_bursts() {
        let watcher = ChangeWatcher::new(Duration::from_millis(100));
        let mut sub = watcher.subscribe();
        let (tx, source) = scripted();
        let handle = watcher.spawn_listener(source, CancellationToken::new());

        for _ in 0..5 {
            tx.send(note(NotificationKind::ContentWrite)).unwrap();
        }

        let event = sub.changed().await.unwrap();
        assert_eq!(event.seq, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!sub.has_pending());

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_store_notifier_feeds_listener() {
        let watcher = ChangeWatcher::new(Duration::ZERO);
        let mut sub = watcher.subscribe();
        let (notifier, source) = commit_channel("events", 1);
        let handle = watcher.spawn_listener(source, CancellationToken::new());

        notifier.content_written();
        notifier.content_written();
        notifier.content_written();

        assert!(sub.changed().await.unwrap().seq >= 1);
        drop(notifier);
        handle.await.unwrap();
    }

    #[test]
    fn test_classify_file_events() {
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            NotificationKind::ContentWrite
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Any)),
            NotificationKind::ContentWrite
        );
        assert_eq!(
            classify(&EventKind::Create(CreateKind::File)),
            NotificationKind::ContentWrite
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime))),
            NotificationKind::MetadataOnly
        );
        assert_eq!(
            classify(&EventKind::Access(AccessKind::Any)),
            NotificationKind::Other
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            NotificationKind::Other
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_writes_publish_one_coalesced_change() {
        let path = std::env::temp_dir().join(format!("eventgate-{}.db", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"seed").unwrap();

        let watcher = ChangeWatcher::new(Duration::from_millis(250));
        let source = FileChangeSource::watch(&path).unwrap();
        assert!(source.name().starts_with("file:"));

        let shutdown = CancellationToken::new();
        let mut sub = watcher.subscribe();
        let listener = watcher.spawn_listener(source, shutdown.clone());

        for i in 0..3 {
            std::fs::write(&path, format!("row {i}")).unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(5), sub.changed())
            .await
            .expect("file write was not published")
            .unwrap();
        assert_eq!(event.seq, 1);

        // The whole burst landed inside the debounce window.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!sub.has_pending());

        shutdown.cancel();
        listener.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
