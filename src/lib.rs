pub mod admission;
pub mod change_watcher;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod live_session;
pub mod metrics;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod store;
pub mod validation;
pub mod view;

pub use admission::{AdmissionChain, AdmissionRejection, CredentialCheck, SharedSecret};
pub use change_watcher::{ChangeSource, ChangeSubscription, ChangeWatcher};
pub use config::Config;
pub use error::{EventGateError, Result};
pub use handlers::AppState;
pub use key_generator::{KeyExtractor, KeyStrategy};
pub use live_session::{LiveSession, SessionConfig, SessionEnd, SessionFrame};
pub use rate_limit_config::LimiterConfig;
pub use rate_limiter::{Decision, RateKey, WindowedLimiter};
pub use server::{build_state, create_app, Server};
pub use store::EventLog;
pub use view::{Period, ViewFilter, ViewRenderer};
