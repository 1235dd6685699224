//! Ratewall - fixed-window HTTP rate limiting
//!
//! This crate implements a rate limiting middleware for axum applications.
//! Each request is counted under its API credential, when that credential
//! has a configured limit, or under its client address otherwise. Counters
//! live in a counting store, either in process memory or shared through
//! Redis, and are reset at fixed window boundaries.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
