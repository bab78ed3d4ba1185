use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::Error;
use crate::rate_limit::AnonymousVerdict;

/// Fixed-window rate state for anonymous callers, keyed by IP.
#[async_trait]
pub trait AnonymousRateStore: Send + Sync {
    /// Atomic check-and-increment: when the stored count is below `max` the
    /// count is bumped and the action allowed, otherwise nothing changes.
    /// A lapsed window starts fresh.
    async fn check_and_increment(
        &self,
        ip_address: &str,
        max: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<AnonymousVerdict, Error>;
}

#[derive(Clone, Copy, Debug)]
struct WindowEntry {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Single-process implementation. The whole check-and-increment runs inside
/// one DashMap entry critical section, so two racing requests from the same
/// IP cannot both pass with max = 1. State is lost on restart.
#[derive(Clone, Default)]
pub struct InMemoryAnonymousRateStore {
    windows: Arc<DashMap<String, WindowEntry>>,
}

impl InMemoryAnonymousRateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AnonymousRateStore for InMemoryAnonymousRateStore {
    async fn check_and_increment(
        &self,
        ip_address: &str,
        max: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<AnonymousVerdict, Error> {
        let mut entry = self
            .windows
            .entry(ip_address.to_string())
            .or_insert(WindowEntry {
                count: 0,
                reset_at: now + window,
            });

        if entry.reset_at <= now {
            entry.count = 0;
            entry.reset_at = now + window;
        }

        let allowed = entry.count < max;
        if allowed {
            entry.count += 1;
        }
        Ok(AnonymousVerdict {
            allowed,
            count: entry.count,
            reset_at: entry.reset_at,
        })
    }
}
