//! Core rate limiter: the admission decision for one request.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::identity::{IdentityKey, Subject};
use super::rules::LimitPolicy;
use super::store::CounterStore;
use crate::error::StoreError;

/// Default bound on a single counting store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of an admission decision that reached a verdict.
///
/// A failed store call is not a decision; it is reported as a [`StoreError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed
    Allow {
        /// Key the request was counted under
        key: IdentityKey,
        /// Count in the current window, `None` when limiting is disabled
        count: Option<u64>,
    },
    /// The request exceeded its limit
    Deny {
        /// Key the request was counted under
        key: IdentityKey,
        /// Count in the current window
        count: u64,
        /// Limit that was exceeded
        max_requests: u64,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    /// The identity key the decision was made for.
    pub fn key(&self) -> &IdentityKey {
        match self {
            Decision::Allow { key, .. } | Decision::Deny { key, .. } => key,
        }
    }
}

/// The admission decision engine.
///
/// Holds the immutable limit policy and a counting store. It keeps no
/// per-request state and can be shared across tasks behind an `Arc`.
pub struct RateLimiter {
    /// Counting store shared by every decision
    store: Arc<dyn CounterStore>,
    /// Configured limits
    policy: LimitPolicy,
    /// Bound on each store call
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter over a store and a policy.
    pub fn new(store: Arc<dyn CounterStore>, policy: LimitPolicy) -> Self {
        Self {
            store,
            policy,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Set the bound on each store call.
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// Get the configured limit policy.
    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// Decide whether the subject's request is admitted.
    ///
    /// Exactly one store call is made for limited subjects and none for
    /// unlimited ones. Store failures and timeouts are returned as errors,
    /// never folded into a decision.
    pub async fn decide(&self, subject: &Subject) -> Result<Decision, StoreError> {
        let (key, limit) = self.policy.resolve(subject);

        if !limit.is_enabled() {
            trace!(key = %key, "Rate limiting disabled for identity");
            return Ok(Decision::Allow { key, count: None });
        }

        let store_key = key.to_store_key();
        let count = match tokio::time::timeout(
            self.store_timeout,
            self.store.increment(&store_key, limit.window()),
        )
        .await
        {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Counting store call failed");
                return Err(e);
            }
            Err(_) => {
                warn!(
                    key = %key,
                    timeout = ?self.store_timeout,
                    "Counting store call timed out"
                );
                return Err(StoreError::Timeout(self.store_timeout));
            }
        };

        trace!(
            key = %key,
            count = count,
            max_requests = limit.max_requests(),
            "Checked rate limit"
        );

        if count > limit.max_requests() {
            debug!(
                key = %key,
                count = count,
                max_requests = limit.max_requests(),
                "Rate limit exceeded"
            );
            Ok(Decision::Deny {
                key,
                count,
                max_requests: limit.max_requests(),
            })
        } else {
            Ok(Decision::Allow {
                key,
                count: Some(count),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::memory::MemoryStore;
    use crate::ratelimit::rules::Limit;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn create_test_policy() -> LimitPolicy {
        LimitPolicy::new(Limit::new(5, Duration::from_secs(1)).unwrap())
            .with_token("token-A", Limit::new(10, Duration::from_secs(2)).unwrap())
            .with_token("token-B", Limit::new(2, Duration::from_secs(3)).unwrap())
            .with_token("token-free", Limit::new(0, Duration::from_secs(1)).unwrap())
    }

    fn create_test_limiter() -> (Arc<MemoryStore>, RateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), create_test_policy());
        (store, limiter)
    }

    /// Store that counts calls and never answers.
    #[derive(Default)]
    struct HangingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for HangingStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<u64, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    /// Sets its flag when dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Store whose pending increment records when it is dropped.
    #[derive(Default)]
    struct DropTrackingStore {
        started: Notify,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CounterStore for DropTrackingStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<u64, StoreError> {
            let _flag = DropFlag(self.dropped.clone());
            self.started.notify_one();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_ip_within_and_over_limit() {
        let (_, limiter) = create_test_limiter();
        let subject = Subject::from_address("192.168.1.1");

        for _ in 0..5 {
            assert!(limiter.decide(&subject).await.unwrap().is_allowed());
        }

        let decision = limiter.decide(&subject).await.unwrap();
        assert_eq!(
            decision,
            Decision::Deny {
                key: IdentityKey::Ip("192.168.1.1".to_string()),
                count: 6,
                max_requests: 5,
            }
        );
    }

    #[tokio::test]
    async fn test_token_limit_overrides_exhausted_ip() {
        let (_, limiter) = create_test_limiter();
        let anonymous = Subject::from_address("192.168.1.3");

        for _ in 0..6 {
            limiter.decide(&anonymous).await.unwrap();
        }
        assert!(!limiter.decide(&anonymous).await.unwrap().is_allowed());

        let with_token = Subject::new(Some("token-A"), "192.168.1.3");
        let decision = limiter.decide(&with_token).await.unwrap();
        assert!(decision.is_allowed());
        assert_eq!(decision.key(), &IdentityKey::Token("token-A".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_token_uses_ip_counter() {
        let (store, limiter) = create_test_limiter();
        let subject = Subject::new(Some("token-unknown"), "192.168.1.4");

        limiter.decide(&subject).await.unwrap();
        limiter.decide(&Subject::from_address("192.168.1.4")).await.unwrap();

        assert_eq!(store.current_count("ip:192.168.1.4"), Some(2));
        assert_eq!(store.current_count("token:token-unknown"), None);
    }

    #[tokio::test]
    async fn test_disabled_limit_skips_store() {
        let store = Arc::new(HangingStore::default());
        let limiter = RateLimiter::new(store.clone(), create_test_policy());

        let decision = limiter
            .decide(&Subject::new(Some("token-free"), "10.0.0.1"))
            .await
            .unwrap();

        assert_eq!(
            decision,
            Decision::Allow {
                key: IdentityKey::Token("token-free".to_string()),
                count: None,
            }
        );
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_allows_again() {
        let (_, limiter) = create_test_limiter();
        let subject = Subject::new(Some("token-B"), "10.0.0.2");

        assert!(limiter.decide(&subject).await.unwrap().is_allowed());
        assert!(limiter.decide(&subject).await.unwrap().is_allowed());
        assert!(!limiter.decide(&subject).await.unwrap().is_allowed());

        tokio::time::advance(Duration::from_secs(3)).await;

        let decision = limiter.decide(&subject).await.unwrap();
        assert_eq!(
            decision,
            Decision::Allow {
                key: IdentityKey::Token("token-B".to_string()),
                count: Some(1),
            }
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_decision() {
        let (store, limiter) = create_test_limiter();
        store.fail_with(Some("redis down"));

        let result = limiter.decide(&Subject::from_address("10.0.0.3")).await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.current_count("ip:10.0.0.3"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out() {
        let store = Arc::new(HangingStore::default());
        let limiter = RateLimiter::new(store.clone(), create_test_policy())
            .with_store_timeout(Duration::from_millis(50));

        let result = limiter.decide(&Subject::from_address("10.0.0.4")).await;

        assert!(matches!(result, Err(StoreError::Timeout(t)) if t == Duration::from_millis(50)));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_decision_drops_store_call() {
        let store = Arc::new(DropTrackingStore::default());
        let limiter = Arc::new(
            RateLimiter::new(store.clone(), create_test_policy())
                .with_store_timeout(Duration::from_secs(3600)),
        );

        let handle = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.decide(&Subject::from_address("10.0.0.5")).await }
        });

        store.started.notified().await;
        assert!(!store.dropped.load(Ordering::SeqCst));

        handle.abort();
        let err = handle.await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(store.dropped.load(Ordering::SeqCst));
    }
}
