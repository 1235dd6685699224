//! Counting store trait for abstracting in-memory and Redis implementations.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

/// Trait for counting store implementations.
///
/// `increment` must be atomic per key: when the key is absent or its window
/// has expired, create it with a count of 1 and arm its expiry at
/// `now + window`; otherwise add one and leave the expiry alone. Concurrent
/// callers on the same key observe a gapless, strictly increasing sequence.
///
/// A failure is reported as a [`StoreError`] and must leave the key as it
/// was.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one request for `key` and return the count in the current window.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, StoreError>;
}
