use chrono::{DateTime, Utc};

pub mod redis;
pub mod store;

pub use redis::RedisAnonymousRateStore;
pub use store::{AnonymousRateStore, InMemoryAnonymousRateStore};

/// Outcome of an anonymous check-and-increment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnonymousVerdict {
    pub allowed: bool,
    /// Count stored after the call. Bumped only when the action was allowed.
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}
