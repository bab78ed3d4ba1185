use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::error;

use crate::auth::Identity;
use crate::ledger::{ActionType, UsageRecord};
use crate::quota::QuotaMetrics;
use crate::storage::{AccountStore, LedgerStore};

/// Writes the accounting trail after a billable action succeeded.
///
/// Infallible from the caller's view: the action already happened, so store
/// failures are logged and dropped rather than propagated. Silent
/// under-counting is a revenue leak, which is why the drops log at error
/// level and feed a counter.
pub struct UsageRecorder {
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn LedgerStore>,
    metrics: Arc<QuotaMetrics>,
}

impl UsageRecorder {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn LedgerStore>,
        metrics: Arc<QuotaMetrics>,
    ) -> Self {
        Self {
            accounts,
            ledger,
            metrics,
        }
    }

    pub async fn record(&self, identity: &Identity, action: ActionType, metadata: Value) {
        self.record_at(identity, action, metadata, Utc::now()).await;
    }

    pub async fn record_at(
        &self,
        identity: &Identity,
        action: ActionType,
        metadata: Value,
        now: DateTime<Utc>,
    ) {
        let record = UsageRecord::new_at(identity, action, metadata, now);

        if let Err(e) = self.ledger.append(&record).await {
            error!(
                "Dropping usage record {} for {}: {e}",
                record.id,
                record.owner()
            );
            self.metrics.record_dropped();
            return;
        }
        self.metrics.record_written();

        // The denormalized counter is advisory; the ledger row above already
        // landed, so a failed increment only degrades display freshness.
        if let Some(user_id) = &record.user_id {
            if let Err(e) = self
                .accounts
                .increment_usage(user_id, action, &record.period)
                .await
            {
                error!("Usage counter increment for user {user_id} failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorDetails};
    use crate::ledger::Period;
    use crate::plan::PlanPolicy;
    use crate::storage::memory::{InMemoryAccountStore, InMemoryLedgerStore};
    use crate::subscription::SubscriptionState;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use tracing_test::traced_test;

    fn user(user_id: &str) -> Identity {
        Identity::User {
            user_id: user_id.to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_record_appends_row_and_bumps_counter() {
        let accounts = Arc::new(InMemoryAccountStore::default());
        let ledger = Arc::new(InMemoryLedgerStore::default());
        accounts
            .ensure_default(SubscriptionState::new_trial_at(
                "user-1",
                7,
                &PlanPolicy::new(),
                now(),
            ))
            .await
            .unwrap();

        let recorder = UsageRecorder::new(
            accounts.clone(),
            ledger.clone(),
            Arc::new(QuotaMetrics::default()),
        );
        recorder
            .record_at(
                &user("user-1"),
                ActionType::Post,
                json!({"topic": "rust"}),
                now(),
            )
            .await;

        assert_eq!(
            ledger.count("user-1", ActionType::Post, None).await.unwrap(),
            1
        );
        let state = accounts.get("user-1").await.unwrap().unwrap();
        assert_eq!(state.usage.counts.get(&ActionType::Post), Some(&1));
    }

    #[tokio::test]
    async fn test_anonymous_record_skips_the_counter() {
        let accounts = Arc::new(InMemoryAccountStore::default());
        let ledger = Arc::new(InMemoryLedgerStore::default());
        let recorder = UsageRecorder::new(
            accounts,
            ledger.clone(),
            Arc::new(QuotaMetrics::default()),
        );

        let identity = Identity::Anonymous {
            ip_address: "203.0.113.9".to_string(),
        };
        recorder
            .record_at(&identity, ActionType::ProfileAnalysis, Value::Null, now())
            .await;

        // The audit row lands under the IP, but user-scoped counting never
        // sees anonymous rows.
        assert_eq!(ledger.rows_for("203.0.113.9").len(), 1);
        assert_eq!(
            ledger
                .count("203.0.113.9", ActionType::ProfileAnalysis, None)
                .await
                .unwrap(),
            0
        );
    }

    struct FailingLedgerStore;

    #[async_trait]
    impl crate::storage::LedgerStore for FailingLedgerStore {
        async fn append(&self, _record: &UsageRecord) -> Result<(), Error> {
            Err(Error::new(ErrorDetails::StoreUnavailable {
                message: "connection refused".to_string(),
            }))
        }

        async fn count(
            &self,
            _user_id: &str,
            _action: ActionType,
            _period: Option<&Period>,
        ) -> Result<u32, Error> {
            Err(Error::new(ErrorDetails::StoreUnavailable {
                message: "connection refused".to_string(),
            }))
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn test_record_swallows_store_failures() {
        let metrics = Arc::new(QuotaMetrics::default());
        let recorder = UsageRecorder::new(
            Arc::new(InMemoryAccountStore::default()),
            Arc::new(FailingLedgerStore),
            metrics.clone(),
        );

        recorder
            .record_at(&user("user-1"), ActionType::Comment, Value::Null, now())
            .await;

        assert!(logs_contain("Dropping usage record"));
        assert_eq!(
            metrics
                .records_dropped
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
