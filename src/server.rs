use crate::admission::{admission_middleware, AdmissionChain, SharedSecret};
use crate::change_watcher::{commit_channel, ChangeWatcher, FileChangeSource};
use crate::config::Config;
use crate::error::{EventGateError, Result};
use crate::handlers::{
    create_event, delete_last_event, health_check, last_event, not_found, subscribe, AppState,
};
use crate::health::HealthChecker;
use crate::key_generator::KeyStrategy;
use crate::metrics::AdmissionMetrics;
use crate::middleware::logging_middleware;
use crate::rate_limiter::WindowedLimiter;
use crate::store::EventLog;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Pending store commits; further writes coalesce while the queue is full.
const COMMIT_QUEUE: usize = 16;

/// Wire limiters, the change watcher and the store, and start their
/// background tasks. All tasks stop when `shutdown` is cancelled.
pub fn build_state(config: &Config, shutdown: CancellationToken) -> Result<AppState> {
    config.validate()?;

    let ip_limiter = WindowedLimiter::new("ip", config.ip_limiter())?;
    let key_limiter = WindowedLimiter::new("api_key", config.key_limiter())?;
    ip_limiter.spawn_sweeper(shutdown.clone());
    key_limiter.spawn_sweeper(shutdown.clone());

    let watcher = ChangeWatcher::new(config.change_debounce);
    let (notifier, commits) = commit_channel("events", COMMIT_QUEUE);
    watcher.spawn_listener(commits, shutdown.clone());
    if let Some(path) = &config.watch_path {
        watcher.spawn_listener(FileChangeSource::watch(path)?, shutdown.clone());
    }

    let store = Arc::new(EventLog::new(config.time_offset()?).with_notifier(notifier));

    let metrics = AdmissionMetrics::new();
    let admission = Arc::new(
        AdmissionChain::new(metrics.clone())
            .rate_limit(ip_limiter.clone(), KeyStrategy::ClientAddress)
            .credential(SharedSecret::new(config.api_key.clone()))
            .rate_limit(key_limiter.clone(), KeyStrategy::api_key()),
    );

    let health = HealthChecker::new(watcher.clone(), vec![ip_limiter, key_limiter], metrics);

    Ok(AppState {
        store,
        watcher,
        admission,
        session: config.session(),
        health,
        shutdown,
    })
}

pub fn create_app(state: AppState) -> Router {
    // Writes pass the admission chain; reads and streams do not.
    let writes = Router::new()
        .route("/events", post(create_event).delete(delete_last_event))
        .route_layer(middleware::from_fn_with_state(
            state.admission.clone(),
            admission_middleware,
        ));

    Router::new()
        .route("/sse", get(subscribe))
        .route("/events/last", get(last_event))
        .route("/health", get(health_check))
        .merge(writes)
        .fallback(not_found)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Server {
    /// Must be called inside a tokio runtime; background tasks start here.
    pub fn new(config: Config) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let state = build_state(&config, shutdown.clone())?;

        Ok(Self {
            app: create_app(state),
            bind_addr: config.bind_addr,
            shutdown,
        })
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| EventGateError::Internal(format!("bind {}: {e}", self.bind_addr)))?;

        info!("Eventgate listening on {}", self.bind_addr);
        info!("Live stream available at /sse");
        info!("Health check available at /health");

        let shutdown = self.shutdown.clone();
        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .map_err(|e| EventGateError::Internal(format!("server: {e}")))?;

        // Also covers a serve loop that ended without a signal.
        self.shutdown.cancel();
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM. Cancelling the token ends every live stream
/// so the graceful drain can finish.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }

    shutdown.cancel();
}
