//! HTTP surface: the rate limiting middleware and the server around it.

mod middleware;
mod server;

pub use middleware::{
    protect, rate_limit_middleware, IdentityExtractor, RateLimitState, Rejection,
    INTERNAL_ERROR_BODY, TOO_MANY_REQUESTS_BODY, UNKNOWN_ADDRESS,
};
pub use server::{app, HttpServer, HOME_BODY};
