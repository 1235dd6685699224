//! Rate limiting middleware for axum routers.
//!
//! The middleware derives a [`Subject`] from each request, asks the
//! [`RateLimiter`] for a decision and either runs the wrapped handler or
//! answers on its behalf.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::{debug, error};

use crate::error::{RatewallError, Result};
use crate::ratelimit::{Decision, RateLimiter, Subject};

/// Body sent with every 429 response.
pub const TOO_MANY_REQUESTS_BODY: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Body sent when the counting store cannot be consulted.
pub const INTERNAL_ERROR_BODY: &str = "internal server error";

/// Address used when a request carries no usable client address.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Proxy headers consulted for the client address, in order.
const FORWARDED_HEADERS: [&str; 2] = ["x-forwarded-for", "x-real-ip"];

/// Terminal responses produced by the limiter instead of the handler.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    /// Limit exceeded
    #[error("too many requests")]
    TooManyRequests,

    /// Counting store failed or timed out
    #[error("internal server error")]
    StoreFailure,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match self {
            Rejection::TooManyRequests => {
                (StatusCode::TOO_MANY_REQUESTS, TOO_MANY_REQUESTS_BODY).into_response()
            }
            Rejection::StoreFailure => {
                (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response()
            }
        }
    }
}

/// Derives the rate limited subject from request metadata.
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    /// Header carrying the API credential
    credential_header: HeaderName,
}

impl IdentityExtractor {
    /// Create an extractor reading credentials from `credential_header`.
    pub fn new(credential_header: &str) -> Result<Self> {
        let credential_header = HeaderName::try_from(credential_header).map_err(|e| {
            RatewallError::Config(format!(
                "invalid credential header {:?}: {}",
                credential_header, e
            ))
        })?;
        Ok(Self { credential_header })
    }

    /// Build the subject for a request.
    ///
    /// The address comes from the first `X-Forwarded-For` entry, then
    /// `X-Real-IP`, then the connection peer, with any port removed.
    pub fn subject(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Subject {
        let credential = headers
            .get(&self.credential_header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let address = forwarded_address(headers)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());

        Subject::new(credential, address)
    }
}

/// First client address found in the proxy headers.
fn forwarded_address(headers: &HeaderMap) -> Option<String> {
    FORWARDED_HEADERS.iter().find_map(|name| {
        let value = headers.get(*name)?.to_str().ok()?;
        let first = value.split(',').next()?.trim();
        if first.is_empty() {
            None
        } else {
            Some(strip_port(first))
        }
    })
}

/// Remove a port suffix from an address such as `203.0.113.9:4711` or
/// `[2001:db8::1]:443`. Anything that is not a socket address is kept as is.
fn strip_port(raw: &str) -> String {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return ip.to_string();
    }
    raw.to_string()
}

/// Shared state of the rate limiting middleware.
#[derive(Clone)]
pub struct RateLimitState {
    /// The decision engine
    limiter: Arc<RateLimiter>,
    /// How subjects are derived from requests
    extractor: IdentityExtractor,
}

impl RateLimitState {
    /// Create the middleware state.
    pub fn new(limiter: Arc<RateLimiter>, extractor: IdentityExtractor) -> Self {
        Self { limiter, extractor }
    }

    /// Get the decision engine.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

/// Rate limiting middleware.
///
/// Runs `next` only when the request is admitted. Denied requests get a 429
/// and store failures a 500; neither reaches the handler.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let subject = state.extractor.subject(req.headers(), peer);

    match state.limiter.decide(&subject).await {
        Ok(Decision::Allow { .. }) => next.run(req).await,
        Ok(Decision::Deny {
            key,
            count,
            max_requests,
        }) => {
            debug!(
                key = %key,
                count = count,
                max_requests = max_requests,
                method = %req.method(),
                path = %req.uri().path(),
                "Request rejected by rate limiter"
            );
            Rejection::TooManyRequests.into_response()
        }
        Err(e) => {
            error!(
                address = %subject.address,
                error = %e,
                "Rate limit check failed, rejecting request"
            );
            Rejection::StoreFailure.into_response()
        }
    }
}

/// Put every route of `router` behind the rate limiter.
pub fn protect(router: Router, state: RateLimitState) -> Router {
    router.layer(axum::middleware::from_fn_with_state(
        state,
        rate_limit_middleware,
    ))
}
