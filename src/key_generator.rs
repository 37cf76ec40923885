//! Rate limit key extraction from inbound requests.
//!
//! This is the only place the admission layer knows anything about the shape
//! of a request.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderName};

use crate::rate_limiter::RateKey;

pub const API_KEY_HEADER: &str = "x-api-key";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
const REAL_IP_HEADER: &str = "x-real-ip";
const UNKNOWN_CLIENT: &str = "unknown";

/// Maps a request to the key a limiter counts it under. `None` means the
/// request carries nothing to key on and the limiter stage does not apply.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, request: &Request) -> Option<RateKey>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&Request) -> Option<RateKey> + Send + Sync,
{
    fn extract(&self, request: &Request) -> Option<RateKey> {
        self(request)
    }
}

/// Built-in extraction strategies
#[derive(Debug, Clone, PartialEq)]
pub enum KeyStrategy {
    /// Normalized client address (forwarded headers, then the peer address)
    ClientAddress,
    /// Raw value of a caller-supplied header, e.g. an API key
    Header(HeaderName),
}

impl KeyStrategy {
    pub fn api_key() -> Self {
        KeyStrategy::Header(HeaderName::from_static(API_KEY_HEADER))
    }
}

impl KeyExtractor for KeyStrategy {
    fn extract(&self, request: &Request) -> Option<RateKey> {
        match self {
            KeyStrategy::ClientAddress => Some(RateKey::new(client_address(request))),
            KeyStrategy::Header(name) => header_value(request.headers(), name).map(RateKey::new),
        }
    }
}

fn header_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Resolve the client address for a request: first hop of `X-Forwarded-For`,
/// then `X-Real-Ip`, then the transport peer address.
pub fn client_address(request: &Request) -> String {
    let headers = request.headers();

    let forwarded = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|chain| chain.split(',').next())
        .and_then(normalize_address);
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get(REAL_IP_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(normalize_address);
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_canonical().to_string();
    }

    UNKNOWN_CLIENT.to_string()
}

/// Parse an address as it appears in proxy headers: bare IPs, `ip:port` and
/// `[v6]:port` are accepted; IPv4-mapped IPv6 collapses to IPv4.
pub fn normalize_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let ip = raw
        .parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))?;

    Some(ip.to_canonical())
}
