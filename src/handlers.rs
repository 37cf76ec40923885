use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    Json,
};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admission::AdmissionChain;
use crate::change_watcher::ChangeWatcher;
use crate::error::EventGateError;
use crate::health::{HealthChecker, HealthStatus};
use crate::live_session::{LiveSession, SessionConfig, SessionFrame};
use crate::response::{LastEventResponse, MessageResponse};
use crate::store::EventLog;
use crate::validation::{RequestValidator, SubscribeQuery};

/// Frames buffered between a session and its response body.
const SESSION_BUFFER: usize = 16;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EventLog>,
    pub watcher: ChangeWatcher,
    pub admission: Arc<AdmissionChain>,
    pub session: SessionConfig,
    pub health: HealthChecker,
    pub shutdown: CancellationToken,
}

fn sse_event(frame: SessionFrame) -> Event {
    match frame {
        SessionFrame::Retry(delay) => Event::default().retry(delay),
        SessionFrame::Update { event, data } => Event::default().event(event).data(data),
        SessionFrame::Heartbeat => Event::default().comment("heartbeat"),
    }
}

/// Open a live view stream
pub async fn subscribe(
    State(state): State<AppState>,
    Query(query): Query<SubscribeQuery>,
) -> Result<impl IntoResponse, EventGateError> {
    let filter = RequestValidator::subscribe_filter(&query, state.store.now_local())?;

    let (tx, rx) = mpsc::channel(SESSION_BUFFER);
    let session = LiveSession::new(
        filter,
        state.store.clone(),
        state.watcher.subscribe(),
        tx,
        state.shutdown.child_token(),
        state.session,
    );
    info!(session = %session.id(), view = %filter, "Opening live stream");
    tokio::spawn(session.run());

    let stream = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(sse_event(frame)));

    Ok(([("x-accel-buffering", "no")], Sse::new(stream)))
}

/// Record a new event
pub async fn create_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, EventGateError> {
    let at = RequestValidator::create_event(&body, Utc::now())?;
    let at = state.store.add(at).await;

    info!(at = %at, "Event recorded");
    Ok(StatusCode::NO_CONTENT)
}

/// Remove the most recent event
pub async fn delete_last_event(
    State(state): State<AppState>,
) -> Result<StatusCode, EventGateError> {
    let removed = state.store.delete_last().await?;

    info!(at = %removed, "Last event removed");
    Ok(StatusCode::NO_CONTENT)
}

/// Time of the most recent event
pub async fn last_event(
    State(state): State<AppState>,
) -> Result<Json<LastEventResponse>, EventGateError> {
    let last_event_at = state
        .store
        .last_event()
        .await
        .ok_or_else(|| EventGateError::NotFound("no events recorded".to_string()))?;

    Ok(Json(LastEventResponse { last_event_at }))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(state.health.check_health())
}

pub async fn not_found() -> (StatusCode, Json<MessageResponse>) {
    (StatusCode::NOT_FOUND, Json(MessageResponse::new("nothing here")))
}
