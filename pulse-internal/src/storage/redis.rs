use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, ErrorDetails};
use crate::ledger::{ActionType, Period, UsageRecord};
use crate::redis_client::RedisClient;
use crate::storage::{is_expiring, needs_trial_reminder, AccountStore, LedgerStore};
use crate::subscription::{SubscriptionState, SubscriptionStatus};

const ACCOUNT_KEY_PREFIX: &str = "pulse:account:";
const USAGE_KEY_PREFIX: &str = "pulse:usage:";
const LEDGER_KEY_PREFIX: &str = "pulse:ledger:";
const COUNT_KEY_PREFIX: &str = "pulse:count:";
const TRIAL_DEADLINES_KEY: &str = "pulse:deadlines:trial";
const SUBSCRIPTION_DEADLINES_KEY: &str = "pulse:deadlines:subscription";

/// Per-period keys outlive the period by two more months so month-boundary
/// queries still resolve.
const PERIOD_KEY_TTL_SECS: i64 = 90 * 24 * 3600;

fn account_key(user_id: &str) -> String {
    format!("{ACCOUNT_KEY_PREFIX}{user_id}")
}

fn usage_key(user_id: &str, period: &Period) -> String {
    format!("{USAGE_KEY_PREFIX}{user_id}:{period}")
}

fn ledger_key(owner: &str) -> String {
    format!("{LEDGER_KEY_PREFIX}{owner}")
}

fn count_key(user_id: &str, action: ActionType, period: Option<&Period>) -> String {
    match period {
        Some(period) => format!("{COUNT_KEY_PREFIX}{user_id}:{action}:{period}"),
        None => format!("{COUNT_KEY_PREFIX}{user_id}:{action}"),
    }
}

fn encode_state(state: &SubscriptionState) -> Result<String, Error> {
    serde_json::to_string(state).map_err(|e| {
        Error::new(ErrorDetails::Serialization {
            message: format!("Failed to serialize subscription state: {e}"),
        })
    })
}

fn decode_state(json: &str) -> Result<SubscriptionState, Error> {
    serde_json::from_str(json).map_err(|e| {
        Error::new(ErrorDetails::Serialization {
            message: format!("Failed to parse subscription state: {e}"),
        })
    })
}

/// Account store shared across gateway replicas. State lives as JSON under
/// one key per user; the per-period counters live in a hash so increments
/// stay atomic; trial/renewal deadlines are indexed in sorted sets so the
/// sweep never scans the keyspace.
pub struct RedisAccountStore {
    redis: Arc<RedisClient>,
}

impl RedisAccountStore {
    pub fn new(redis: Arc<RedisClient>) -> Self {
        Self { redis }
    }

    async fn index_deadlines(&self, state: &SubscriptionState) -> Result<(), Error> {
        let mut conn = self.redis.connection();
        let user_id = state.user_id.clone();
        let mut pipe = redis::pipe();
        match (state.status, state.trial_ends_at) {
            (SubscriptionStatus::Trial, Some(at)) => {
                pipe.zadd(TRIAL_DEADLINES_KEY, &user_id, at.timestamp())
                    .ignore();
            }
            _ => {
                pipe.zrem(TRIAL_DEADLINES_KEY, &user_id).ignore();
            }
        }
        match (state.status, state.subscription_ends_at) {
            (SubscriptionStatus::Active, Some(at)) => {
                pipe.zadd(SUBSCRIPTION_DEADLINES_KEY, &user_id, at.timestamp())
                    .ignore();
            }
            _ => {
                pipe.zrem(SUBSCRIPTION_DEADLINES_KEY, &user_id).ignore();
            }
        }
        self.redis
            .run("deadline index update", async move {
                pipe.query_async::<()>(&mut conn).await
            })
            .await
    }

    /// The JSON snapshot's counters go stale between writes; the hash is
    /// authoritative for the current period.
    async fn hydrate_usage(&self, state: &mut SubscriptionState) -> Result<(), Error> {
        let period = Period::current();
        let key = usage_key(&state.user_id, &period);
        let mut conn = self.redis.connection();
        let counts: HashMap<String, u32> = self
            .redis
            .run("HGETALL usage", async move { conn.hgetall(&key).await })
            .await?;
        state.usage.period = period;
        state.usage.counts = counts
            .into_iter()
            .filter_map(|(name, count)| name.parse::<ActionType>().ok().map(|a| (a, count)))
            .collect();
        Ok(())
    }

    async fn fetch_deadline_members(
        &self,
        key: &'static str,
        min: String,
        max: String,
    ) -> Result<Vec<String>, Error> {
        let mut conn = self.redis.connection();
        self.redis
            .run("ZRANGEBYSCORE deadlines", async move {
                conn.zrangebyscore(key, min, max).await
            })
            .await
    }
}

#[async_trait]
impl AccountStore for RedisAccountStore {
    async fn ensure_default(
        &self,
        default: SubscriptionState,
    ) -> Result<SubscriptionState, Error> {
        let key = account_key(&default.user_id);
        let json = encode_state(&default)?;
        let mut conn = self.redis.connection();
        // SET NX GET returns the existing value when the user already has
        // state, nil when this call created it. One round trip, atomic.
        let previous: Option<String> = self
            .redis
            .run("SET account NX", async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&json)
                    .arg("NX")
                    .arg("GET")
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        match previous {
            Some(existing) => decode_state(&existing),
            None => {
                self.index_deadlines(&default).await?;
                Ok(default)
            }
        }
    }

    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionState>, Error> {
        let key = account_key(user_id);
        let mut conn = self.redis.connection();
        let json: Option<String> = self
            .redis
            .run("GET account", async move {
                conn.get::<_, Option<String>>(&key).await
            })
            .await?;
        match json {
            Some(json) => {
                let mut state = decode_state(&json)?;
                self.hydrate_usage(&mut state).await?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, state: SubscriptionState) -> Result<(), Error> {
        let key = account_key(&state.user_id);
        let json = encode_state(&state)?;
        let mut conn = self.redis.connection();
        self.redis
            .run("SET account", async move {
                conn.set::<_, _, ()>(&key, &json).await
            })
            .await?;
        self.index_deadlines(&state).await
    }

    async fn increment_usage(
        &self,
        user_id: &str,
        action: ActionType,
        period: &Period,
    ) -> Result<(), Error> {
        let key = usage_key(user_id, period);
        let field = action.to_string();
        let mut conn = self.redis.connection();
        self.redis
            .run("HINCRBY usage", async move {
                redis::pipe()
                    .atomic()
                    .hincr(&key, &field, 1)
                    .ignore()
                    .expire(&key, PERIOD_KEY_TTL_SECS)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await
            })
            .await
    }

    async fn find_expiring(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionState>, Error> {
        let mut user_ids = self
            .fetch_deadline_members(
                TRIAL_DEADLINES_KEY,
                "-inf".to_string(),
                now.timestamp().to_string(),
            )
            .await?;
        user_ids.extend(
            self.fetch_deadline_members(
                SUBSCRIPTION_DEADLINES_KEY,
                "-inf".to_string(),
                now.timestamp().to_string(),
            )
            .await?,
        );

        let mut expiring = Vec::new();
        for user_id in user_ids {
            if let Some(state) = self.get(&user_id).await? {
                // The sorted set is an index, the JSON stays authoritative.
                if is_expiring(&state, now) {
                    expiring.push(state);
                }
            }
        }
        Ok(expiring)
    }

    async fn find_trials_ending_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<SubscriptionState>, Error> {
        let user_ids = self
            .fetch_deadline_members(
                TRIAL_DEADLINES_KEY,
                format!("({}", now.timestamp()),
                (now + window).timestamp().to_string(),
            )
            .await?;

        let mut pending = Vec::new();
        for user_id in user_ids {
            if let Some(state) = self.get(&user_id).await? {
                if needs_trial_reminder(&state, now, window) {
                    pending.push(state);
                }
            }
        }
        Ok(pending)
    }

    async fn mark_reminder_sent(&self, user_id: &str) -> Result<(), Error> {
        if let Some(mut state) = self.get(user_id).await? {
            state.trial_reminder_sent = true;
            state.updated_at = Utc::now();
            self.put(state).await?;
        }
        Ok(())
    }
}

/// Ledger shared across gateway replicas. Rows are pushed onto a per-owner
/// list; per-action counters are bumped in the same MULTI so `count` is a
/// single GET at evaluation time.
pub struct RedisLedgerStore {
    redis: Arc<RedisClient>,
}

impl RedisLedgerStore {
    pub fn new(redis: Arc<RedisClient>) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    async fn append(&self, record: &UsageRecord) -> Result<(), Error> {
        let json = serde_json::to_string(record).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize usage record: {e}"),
            })
        })?;
        let list_key = ledger_key(&record.owner());

        let mut pipe = redis::pipe();
        pipe.atomic().lpush(&list_key, &json).ignore();
        if let Some(user_id) = &record.user_id {
            let total_key = count_key(user_id, record.action_type, None);
            let period_key = count_key(user_id, record.action_type, Some(&record.period));
            pipe.incr(&total_key, 1).ignore();
            pipe.incr(&period_key, 1).ignore();
            pipe.expire(&period_key, PERIOD_KEY_TTL_SECS).ignore();
        }

        let mut conn = self.redis.connection();
        self.redis
            .run("ledger append", async move {
                pipe.query_async::<()>(&mut conn).await
            })
            .await
    }

    async fn count(
        &self,
        user_id: &str,
        action: ActionType,
        period: Option<&Period>,
    ) -> Result<u32, Error> {
        let key = count_key(user_id, action, period);
        let mut conn = self.redis.connection();
        let count: Option<u32> = self
            .redis
            .run("GET count", async move {
                conn.get::<_, Option<u32>>(&key).await
            })
            .await?;
        Ok(count.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanPolicy;
    use chrono::TimeZone;

    #[test]
    fn test_key_layout() {
        let period: Period = "2025-06".parse().unwrap();
        assert_eq!(account_key("user-1"), "pulse:account:user-1");
        assert_eq!(usage_key("user-1", &period), "pulse:usage:user-1:2025-06");
        assert_eq!(ledger_key("203.0.113.9"), "pulse:ledger:203.0.113.9");
        assert_eq!(
            count_key("user-1", ActionType::Post, None),
            "pulse:count:user-1:post"
        );
        assert_eq!(
            count_key("user-1", ActionType::ProfileAnalysis, Some(&period)),
            "pulse:count:user-1:profile_analysis:2025-06"
        );
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let state = SubscriptionState::new_trial_at("user-1", 7, &PlanPolicy::new(), now);
        let json = encode_state(&state).unwrap();
        let decoded = decode_state(&json).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_decode_failure_is_a_serialization_error() {
        let result = decode_state("{not json");
        assert!(result.is_err());
    }
}
