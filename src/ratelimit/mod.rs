//! Rate limiting logic and counting stores.

mod counter;
mod identity;
mod limiter;
mod memory;
mod redis_store;
mod rules;
mod store;

pub use counter::CounterRecord;
pub use identity::{IdentityKey, Subject};
pub use limiter::{Decision, RateLimiter, DEFAULT_STORE_TIMEOUT};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use rules::{parse_duration, Limit, LimitPolicy, LimitRule, TokenRule};
pub use store::CounterStore;
