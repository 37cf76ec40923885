//! Ordered admission gates applied in front of protected write operations.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use crate::error::ErrorResponse;
use crate::key_generator::{self, KeyExtractor, API_KEY_HEADER};
use crate::metrics::AdmissionMetrics;
use crate::rate_limiter::{Decision, WindowedLimiter};

/// Why a request was turned away before reaching the protected operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionRejection {
    MissingCredential,
    InvalidCredential,
    Forbidden,
    RateLimited {
        limiter: &'static str,
        retry_after: Duration,
    },
}

impl AdmissionRejection {
    fn body(&self) -> ErrorResponse {
        match self {
            AdmissionRejection::MissingCredential => {
                ErrorResponse::new("missing_credential", "API key required", 401)
            }
            AdmissionRejection::InvalidCredential => {
                ErrorResponse::new("invalid_credential", "API key not recognised", 401)
            }
            AdmissionRejection::Forbidden => {
                ErrorResponse::new("forbidden", "writes are disabled on this server", 403)
            }
            AdmissionRejection::RateLimited { .. } => {
                ErrorResponse::new("rate_limited", "too many requests, slow down", 429)
            }
        }
    }
}

impl IntoResponse for AdmissionRejection {
    fn into_response(self) -> Response {
        let body = self.body();
        let mut response = (body.status(), Json(body)).into_response();

        if let AdmissionRejection::RateLimited { retry_after, .. } = self {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }

        response
    }
}

/// Black-box credential predicate.
pub trait CredentialCheck: Send + Sync {
    fn verify(&self, request: &Request) -> Result<(), AdmissionRejection>;
}

/// Static shared-secret comparison against a request header. With no secret
/// configured every write is forbidden.
#[derive(Debug, Clone)]
pub struct SharedSecret {
    header: HeaderName,
    secret: Option<String>,
}

impl SharedSecret {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            header: HeaderName::from_static(API_KEY_HEADER),
            secret,
        }
    }
}

impl CredentialCheck for SharedSecret {
    fn verify(&self, request: &Request) -> Result<(), AdmissionRejection> {
        let presented = request
            .headers()
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or(AdmissionRejection::MissingCredential)?;

        match &self.secret {
            None => Err(AdmissionRejection::Forbidden),
            Some(secret) if secret == presented => Ok(()),
            Some(_) => Err(AdmissionRejection::InvalidCredential),
        }
    }
}

enum Gate {
    RateLimit {
        limiter: WindowedLimiter,
        extractor: Arc<dyn KeyExtractor>,
    },
    Credential(Arc<dyn CredentialCheck>),
}

/// Gates run in insertion order; the first rejection short-circuits.
pub struct AdmissionChain {
    gates: Vec<Gate>,
    metrics: AdmissionMetrics,
}

impl AdmissionChain {
    pub fn new(metrics: AdmissionMetrics) -> Self {
        Self {
            gates: Vec::new(),
            metrics,
        }
    }

    pub fn rate_limit(
        mut self,
        limiter: WindowedLimiter,
        extractor: impl KeyExtractor + 'static,
    ) -> Self {
        self.gates.push(Gate::RateLimit {
            limiter,
            extractor: Arc::new(extractor),
        });
        self
    }

    pub fn credential(mut self, check: impl CredentialCheck + 'static) -> Self {
        self.gates.push(Gate::Credential(Arc::new(check)));
        self
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Run every gate against `request`.
    pub fn check(&self, request: &Request) -> Result<(), AdmissionRejection> {
        for gate in &self.gates {
            let outcome = match gate {
                Gate::RateLimit { limiter, extractor } => {
                    let Some(key) = extractor.extract(request) else {
                        continue;
                    };
                    match limiter.admit(key.as_str()) {
                        Decision::Allowed { .. } => Ok(()),
                        Decision::Limited { retry_after } => Err(AdmissionRejection::RateLimited {
                            limiter: limiter.name(),
                            retry_after,
                        }),
                    }
                }
                Gate::Credential(check) => check.verify(request),
            };

            if let Err(rejection) = outcome {
                match rejection {
                    AdmissionRejection::RateLimited { .. } => self.metrics.record_rate_limited(),
                    _ => self.metrics.record_credential_rejected(),
                }
                return Err(rejection);
            }
        }

        self.metrics.record_admitted();
        Ok(())
    }
}

/// Middleware running the chain before the wrapped handler.
pub async fn admission_middleware(
    State(chain): State<Arc<AdmissionChain>>,
    request: Request,
    next: Next,
) -> Response {
    if let Err(rejection) = chain.check(&request) {
        warn!(
            target: "eventgate::admission",
            method = %request.method(),
            uri = %request.uri(),
            client_ip = %key_generator::client_address(&request),
            rejection = ?rejection,
            "Request rejected"
        );
        return rejection.into_response();
    }

    next.run(request).await
}
