use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::Error;
use crate::ledger::{ActionType, Period, UsageRecord};
use crate::storage::{is_expiring, needs_trial_reminder, AccountStore, LedgerStore};
use crate::subscription::SubscriptionState;

/// Single-process account store. The DashMap entry API gives the upsert and
/// increment their atomicity (both run under the entry's shard lock).
#[derive(Clone, Default)]
pub struct InMemoryAccountStore {
    accounts: Arc<DashMap<String, SubscriptionState>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn ensure_default(
        &self,
        default: SubscriptionState,
    ) -> Result<SubscriptionState, Error> {
        let entry = self
            .accounts
            .entry(default.user_id.clone())
            .or_insert(default);
        Ok(entry.clone())
    }

    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionState>, Error> {
        Ok(self.accounts.get(user_id).map(|entry| entry.clone()))
    }

    async fn put(&self, state: SubscriptionState) -> Result<(), Error> {
        self.accounts.insert(state.user_id.clone(), state);
        Ok(())
    }

    async fn increment_usage(
        &self,
        user_id: &str,
        action: ActionType,
        period: &Period,
    ) -> Result<(), Error> {
        match self.accounts.get_mut(user_id) {
            Some(mut state) => {
                if state.usage.period != *period {
                    state.usage.period = *period;
                    state.usage.counts.clear();
                }
                *state.usage.counts.entry(action).or_insert(0) += 1;
                state.updated_at = Utc::now();
            }
            None => {
                tracing::warn!("No subscription state for user {user_id} while counting usage");
            }
        }
        Ok(())
    }

    async fn find_expiring(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionState>, Error> {
        Ok(self
            .accounts
            .iter()
            .filter(|entry| is_expiring(entry.value(), now))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn find_trials_ending_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<SubscriptionState>, Error> {
        Ok(self
            .accounts
            .iter()
            .filter(|entry| needs_trial_reminder(entry.value(), now, window))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn mark_reminder_sent(&self, user_id: &str) -> Result<(), Error> {
        if let Some(mut state) = self.accounts.get_mut(user_id) {
            state.trial_reminder_sent = true;
            state.updated_at = Utc::now();
        }
        Ok(())
    }
}

/// Single-process append-only ledger, keyed by the identity that performed
/// the action.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    records: Arc<DashMap<String, Vec<UsageRecord>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn rows_for(&self, owner: &str) -> Vec<UsageRecord> {
        self.records
            .get(owner)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append(&self, record: &UsageRecord) -> Result<(), Error> {
        self.records
            .entry(record.owner())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn count(
        &self,
        user_id: &str,
        action: ActionType,
        period: Option<&Period>,
    ) -> Result<u32, Error> {
        let count = self
            .records
            .get(user_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| {
                        r.user_id.as_deref() == Some(user_id)
                            && r.action_type == action
                            && period.is_none_or(|p| r.period == *p)
                    })
                    .count()
            })
            .unwrap_or(0);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
