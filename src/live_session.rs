//! Server-side coordinator of one long-lived push connection.
//!
//! A session renders its view once on connect, again after every change
//! signal, and writes a keepalive on every heartbeat tick. Exactly one task
//! drives [`LiveSession::run`]; the frames it produces go into a bounded
//! channel whose receiving half is the response body. When the client goes
//! away the body (and with it the receiver) is dropped, which the session
//! observes as a lost connection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::change_watcher::ChangeSubscription;
use crate::view::{ViewFilter, ViewRenderer};

/// SSE event name carried by update frames.
pub const UPDATE_EVENT: &str = "update";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(with = "humantime_serde")]
    pub heartbeat: Duration,
    /// Reconnect delay advised to the client on connect.
    #[serde(with = "humantime_serde")]
    pub retry: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            retry: Duration::from_secs(3),
        }
    }
}

/// One unit written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFrame {
    Retry(Duration),
    Update { event: &'static str, data: String },
    Heartbeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Streaming,
    Closed,
}

/// Why a session reached [`SessionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Cancelled,
    ConnectionLost,
    WatcherClosed,
}

pub struct LiveSession {
    id: Uuid,
    filter: ViewFilter,
    renderer: Arc<dyn ViewRenderer>,
    changes: ChangeSubscription,
    sink: mpsc::Sender<SessionFrame>,
    cancel: CancellationToken,
    config: SessionConfig,
    state: SessionState,
    last_payload: Option<String>,
}

impl LiveSession {
    pub fn new(
        filter: ViewFilter,
        renderer: Arc<dyn ViewRenderer>,
        changes: ChangeSubscription,
        sink: mpsc::Sender<SessionFrame>,
        cancel: CancellationToken,
        config: SessionConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            filter,
            renderer,
            changes,
            sink,
            cancel,
            config,
            state: SessionState::Connecting,
            last_payload: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion. Consumes the session, so the change
    /// subscription and heartbeat timer are released exactly once on return.
    pub async fn run(mut self) -> SessionEnd {
        info!(session = %self.id, view = %self.filter, "Live session connected");

        let end = match self.connect().await {
            Ok(()) => self.stream().await,
            Err(end) => end,
        };

        self.state = SessionState::Closed;
        info!(session = %self.id, reason = ?end, "Live session closed");
        end
    }

    async fn connect(&mut self) -> Result<(), SessionEnd> {
        self.push(SessionFrame::Retry(self.config.retry)).await?;
        self.render_and_push().await?;
        self.state = SessionState::Streaming;
        Ok(())
    }

    async fn stream(&mut self) -> SessionEnd {
        let every = self.config.heartbeat;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(SessionEnd::Cancelled),
                _ = self.sink.closed() => Err(SessionEnd::ConnectionLost),
                changed = self.changes.changed() => match changed {
                    Ok(event) => {
                        debug!(session = %self.id, seq = event.seq, "Change received");
                        self.render_and_push().await
                    }
                    Err(_) => Err(SessionEnd::WatcherClosed),
                },
                _ = heartbeat.tick() => self.push(SessionFrame::Heartbeat).await,
            };

            if let Err(end) = step {
                return end;
            }
        }
    }

    /// Render the view and send it if it differs from what the client already
    /// has. Render failures are logged and leave the session open.
    async fn render_and_push(&mut self) -> Result<(), SessionEnd> {
        let rendered = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionEnd::Cancelled),
            rendered = self.renderer.render_view(&self.filter) => rendered,
        };

        let payload = match rendered {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session = %self.id, error = %e, "Render failed; waiting for next change");
                return Ok(());
            }
        };

        if self.last_payload.as_deref() == Some(payload.as_str()) {
            debug!(session = %self.id, "View unchanged; skipping update");
            return Ok(());
        }

        self.push(SessionFrame::Update {
            event: UPDATE_EVENT,
            data: payload.clone(),
        })
        .await?;
        self.last_payload = Some(payload);
        Ok(())
    }

    async fn push(&mut self, frame: SessionFrame) -> Result<(), SessionEnd> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionEnd::Cancelled),
            sent = self.sink.send(frame) => sent.map_err(|_| SessionEnd::ConnectionLost),
        }
    }
}
