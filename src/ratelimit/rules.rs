//! Rate limit rules and identity resolution.
//!
//! A [`LimitPolicy`] holds the default address limit and the per-credential
//! limits. It is built once at startup from [`LimitRule`]s and is read-only
//! afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::identity::{IdentityKey, Subject};
use crate::error::{RatewallError, Result};

/// A validated limit: at most `max_requests` per `window`.
///
/// `max_requests == 0` disables limiting for the identity class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    max_requests: u64,
    window: Duration,
}

impl Limit {
    /// Build a limit, rejecting a zero-length window.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(RatewallError::Config(
                "rate limit window must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            max_requests,
            window,
        })
    }

    /// Maximum requests allowed within one window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Length of the fixed window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether this limit actually restricts traffic.
    pub fn is_enabled(&self) -> bool {
        self.max_requests > 0
    }
}

/// A rate limit rule as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRule {
    /// Number of requests allowed per window (0 disables limiting)
    pub max_requests: i64,
    /// Window length, e.g. `1s`, `500ms`, `1m30s`
    pub window: String,
}

impl LimitRule {
    /// Create a rule from its raw parts.
    pub fn new(max_requests: i64, window: impl Into<String>) -> Self {
        Self {
            max_requests,
            window: window.into(),
        }
    }

    /// Validate the rule and convert it into a [`Limit`].
    pub fn to_limit(&self) -> Result<Limit> {
        let max_requests = u64::try_from(self.max_requests).map_err(|_| {
            RatewallError::Config(format!(
                "max_requests must not be negative, got {}",
                self.max_requests
            ))
        })?;
        let window = parse_duration(&self.window)?;
        Limit::new(max_requests, window)
    }
}

/// A limit attached to one API credential, as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRule {
    /// Credential value presented in the credential header
    pub token: String,
    /// Number of requests allowed per window (0 disables limiting)
    pub max_requests: i64,
    /// Window length
    pub window: String,
}

impl TokenRule {
    /// Create a rule for a credential.
    pub fn new(token: impl Into<String>, max_requests: i64, window: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            max_requests,
            window: window.into(),
        }
    }

    /// The limit part of this rule.
    pub fn rule(&self) -> LimitRule {
        LimitRule::new(self.max_requests, self.window.clone())
    }
}

/// Parse a duration string made of `<number><unit>` segments.
///
/// Supported units are `ms`, `s`, `m` and `h`; segments add up, so `1m30s`
/// is ninety seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || RatewallError::Config(format!("invalid duration: {:?}", input));

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let segment = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            _ => return Err(invalid()),
        };
        total = total.checked_add(segment).ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }

    Ok(total)
}

/// Prefix a configuration error with the setting it came from.
fn with_context(setting: &str, err: RatewallError) -> RatewallError {
    match err {
        RatewallError::Config(msg) => RatewallError::Config(format!("{}: {}", setting, msg)),
        other => other,
    }
}

/// The complete, immutable set of limits applied by the rate limiter.
#[derive(Debug, Clone)]
pub struct LimitPolicy {
    /// Limit applied to subjects identified by address
    default_ip: Limit,
    /// Limits for known credentials
    tokens: HashMap<String, Limit>,
}

impl LimitPolicy {
    /// Create a policy with only an address limit.
    pub fn new(default_ip: Limit) -> Self {
        Self {
            default_ip,
            tokens: HashMap::new(),
        }
    }

    /// Add a limit for a credential.
    pub fn with_token(mut self, credential: impl Into<String>, limit: Limit) -> Self {
        self.tokens.insert(credential.into(), limit);
        self
    }

    /// Build a policy from configuration rules, validating every rule.
    pub fn from_rules(ip: &LimitRule, tokens: &[TokenRule]) -> Result<Self> {
        let default_ip = ip
            .to_limit()
            .map_err(|e| with_context("limits.ip", e))?;

        let mut policy = Self::new(default_ip);
        for token_rule in tokens {
            if token_rule.token.is_empty() {
                return Err(RatewallError::Config(
                    "limits.tokens: token must not be empty".to_string(),
                ));
            }
            let limit = token_rule
                .rule()
                .to_limit()
                .map_err(|e| with_context(&format!("limits.tokens.{}", token_rule.token), e))?;
            if policy.tokens.insert(token_rule.token.clone(), limit).is_some() {
                return Err(RatewallError::Config(format!(
                    "limits.tokens: duplicate token {}",
                    token_rule.token
                )));
            }
        }
        Ok(policy)
    }

    /// The limit applied to address-identified subjects.
    pub fn default_ip(&self) -> Limit {
        self.default_ip
    }

    /// The limit configured for a credential, if any.
    pub fn token_limit(&self, credential: &str) -> Option<Limit> {
        self.tokens.get(credential).copied()
    }

    /// Resolve the identity key and limit for a subject.
    ///
    /// A non-empty credential with a configured limit wins; anything else is
    /// keyed by address under the default limit.
    pub fn resolve(&self, subject: &Subject) -> (IdentityKey, Limit) {
        if let Some(credential) = subject.credential() {
            if let Some(limit) = self.token_limit(credential) {
                return (IdentityKey::Token(credential.to_string()), limit);
            }
        }

        (IdentityKey::Ip(subject.address.clone()), self.default_ip)
    }
}
