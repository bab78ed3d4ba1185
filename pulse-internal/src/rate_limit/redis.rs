use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use redis::Script;
use std::sync::Arc;

use crate::error::{Error, ErrorDetails};
use crate::rate_limit::{AnonymousRateStore, AnonymousVerdict};
use crate::redis_client::RedisClient;

/// Fixed-window limiter shared across gateway replicas. The whole
/// check-and-increment runs inside one Lua script, so the window stays atomic
/// under concurrent requests landing on different replicas.
pub struct RedisAnonymousRateStore {
    redis: Arc<RedisClient>,
    check_and_increment_script: Script,
}

impl RedisAnonymousRateStore {
    pub fn new(redis: Arc<RedisClient>) -> Self {
        let check_and_increment_script = Script::new(
            r#"
            local key = KEYS[1]
            local max = tonumber(ARGV[1])
            local window = tonumber(ARGV[2])
            local now = tonumber(ARGV[3])

            local count = tonumber(redis.call('HGET', key, 'count') or '0')
            local reset_at = tonumber(redis.call('HGET', key, 'reset_at') or '0')

            -- A lapsed window starts fresh
            if reset_at <= now then
                count = 0
                reset_at = now + window
            end

            local allowed = 0
            if count < max then
                count = count + 1
                allowed = 1
            end

            redis.call('HSET', key, 'count', count, 'reset_at', reset_at)
            redis.call('EXPIRE', key, math.max(reset_at - now, 1))
            return {allowed, count, reset_at}
            "#,
        );
        Self {
            redis,
            check_and_increment_script,
        }
    }
}

#[async_trait]
impl AnonymousRateStore for RedisAnonymousRateStore {
    async fn check_and_increment(
        &self,
        ip_address: &str,
        max: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<AnonymousVerdict, Error> {
        let key = format!("pulse:anon:{ip_address}");
        let mut conn = self.redis.connection();
        let result: Vec<i64> = self
            .redis
            .run("anonymous window script", async move {
                self.check_and_increment_script
                    .key(&key)
                    .arg(max)
                    .arg(window.num_seconds())
                    .arg(now.timestamp())
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        parse_verdict(&result)
    }
}

fn parse_verdict(result: &[i64]) -> Result<AnonymousVerdict, Error> {
    if result.len() < 3 {
        return Err(Error::new(ErrorDetails::StoreUnavailable {
            message: "Invalid Redis response for anonymous window".to_string(),
        }));
    }
    let reset_at = Utc.timestamp_opt(result[2], 0).single().ok_or_else(|| {
        Error::new(ErrorDetails::StoreUnavailable {
            message: format!("Invalid reset timestamp from Redis: {}", result[2]),
        })
    })?;
    Ok(AnonymousVerdict {
        allowed: result[0] == 1,
        count: u32::try_from(result[1]).unwrap_or(0),
        reset_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_allowed_verdict() {
        let reset = Utc::now().timestamp() + 86400;
        let verdict = parse_verdict(&[1, 1, reset]).unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.count, 1);
        assert_eq!(verdict.reset_at.timestamp(), reset);
    }

    #[test]
    fn test_parse_denied_verdict() {
        let reset = Utc::now().timestamp() + 3600;
        let verdict = parse_verdict(&[0, 1, reset]).unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.count, 1);
    }

    #[test]
    fn test_parse_rejects_short_reply() {
        assert!(parse_verdict(&[1, 1]).is_err());
    }
}
