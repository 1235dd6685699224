//! Redis-backed counting store.
//!
//! The increment and the expiry are issued together in one Lua script, so
//! Redis applies them as a single unit: no caller can observe a counter
//! without its expiry or an expiry without its increment.
//!
//! The fixed-window expiry is only observable against a running server; the
//! ignored tests below exercise it with `REDIS_URL` (default
//! `redis://localhost:6379`) via `cargo test -- --ignored`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tracing::{info, trace};

use super::store::CounterStore;
use crate::error::{RatewallError, Result, StoreError};

/// Increment `KEYS[1]` and arm a `ARGV[1]` millisecond expiry when the
/// window has just opened. A counter left without a TTL is re-armed too, so
/// a key can never outlive its window forever.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// A counting store shared through a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    /// Multiplexed connection, reconnected automatically on failure
    connection: ConnectionManager,
    /// Prepared increment script, invoked by SHA with a fallback to EVAL
    script: Script,
}

impl RedisStore {
    /// Connect to Redis at `url` and verify the server answers `PING`
    /// within `connect_timeout`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<Self> {
        let client = Client::open(url)?;

        let connection = tokio::time::timeout(connect_timeout, async {
            let mut connection = ConnectionManager::new(client).await?;
            let pong: String = redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<_, redis::RedisError>((connection, pong))
        })
        .await
        .map_err(|_| {
            RatewallError::Store(StoreError::Timeout(connect_timeout))
        })?;

        let (connection, pong) = connection?;
        info!(url = %url, reply = %pong, "Connected to Redis");

        Ok(Self::with_connection(connection))
    }

    /// Wrap an already established connection.
    pub fn with_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(INCREMENT_SCRIPT),
        }
    }
}

/// Milliseconds passed to `PEXPIRE`; never zero, which Redis would treat as
/// an immediate delete.
fn expiry_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> std::result::Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        let mut invocation = self.script.key(key);
        invocation.arg(expiry_millis(window));

        let count: i64 = invocation.invoke_async(&mut connection).await?;
        let count = u64::try_from(count)
            .map_err(|_| StoreError::Backend(format!("counter for {} is negative: {}", key, count)))?;

        trace!(key, count, "Incremented Redis counter");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_millis() {
        assert_eq!(expiry_millis(Duration::from_secs(1)), 1000);
        assert_eq!(expiry_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(expiry_millis(Duration::from_micros(10)), 1);
    }

    #[test]
    fn test_script_only_arms_expiry_on_new_window() {
        assert!(INCREMENT_SCRIPT.contains("redis.call('INCR', KEYS[1])"));
        assert!(INCREMENT_SCRIPT.contains("count == 1"));
        assert!(INCREMENT_SCRIPT.contains("PEXPIRE"));
        assert!(!INCREMENT_SCRIPT.contains("'EXPIRE'"));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisStore::connect("not a url", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(RatewallError::Redis(_))));
    }

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
    }

    async fn pttl(store: &RedisStore, key: &str) -> i64 {
        let mut connection = store.connection.clone();
        redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_increment_does_not_extend_window() {
        let store = RedisStore::connect(&redis_url(), Duration::from_secs(2))
            .await
            .unwrap();
        let key = format!("ratewall-test:fixed-window:{}", std::process::id());
        let window = Duration::from_secs(2);

        assert_eq!(store.increment(&key, window).await.unwrap(), 1);
        let first_ttl = pttl(&store, &key).await;
        assert!(first_ttl > 0 && first_ttl <= 2000);

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(store.increment(&key, window).await.unwrap(), 2);
        let second_ttl = pttl(&store, &key).await;
        assert!(second_ttl > 0);
        assert!(
            second_ttl <= first_ttl - 400,
            "expiry was re-armed: {} then {}",
            first_ttl,
            second_ttl
        );

        let mut connection = store.connection.clone();
        let _: () = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut connection)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_window_reopens_after_expiry() {
        let store = RedisStore::connect(&redis_url(), Duration::from_secs(2))
            .await
            .unwrap();
        let key = format!("ratewall-test:reopen:{}", std::process::id());
        let window = Duration::from_millis(300);

        assert_eq!(store.increment(&key, window).await.unwrap(), 1);
        assert_eq!(store.increment(&key, window).await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(store.increment(&key, window).await.unwrap(), 1);
    }
}
