use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Error;
use crate::ledger::{ActionType, Period, UsageRecord};
use crate::subscription::{SubscriptionState, SubscriptionStatus};

pub mod memory;
pub mod redis;

/// Subscription state persistence.
///
/// Implementations must provide a unique-key upsert (`ensure_default`) and an
/// atomic counter increment; quota evaluation and the sweep are built on
/// those two guarantees.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Creates `default` if no state exists for its user, otherwise leaves
    /// the stored state alone. Returns whatever ends up stored. Idempotent
    /// under concurrent calls for the same user.
    async fn ensure_default(&self, default: SubscriptionState)
        -> Result<SubscriptionState, Error>;

    async fn get(&self, user_id: &str) -> Result<Option<SubscriptionState>, Error>;

    async fn put(&self, state: SubscriptionState) -> Result<(), Error>;

    /// Atomically bumps the denormalized counter for (user, action) within
    /// `period`, rolling the counters when the period has changed.
    async fn increment_usage(
        &self,
        user_id: &str,
        action: ActionType,
        period: &Period,
    ) -> Result<(), Error>;

    /// Trials past `trial_ends_at` and active subscriptions past
    /// `subscription_ends_at` as of `now`.
    async fn find_expiring(&self, now: DateTime<Utc>) -> Result<Vec<SubscriptionState>, Error>;

    /// Unreminded trials ending within `window` of `now` (but not yet due).
    async fn find_trials_ending_within(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<SubscriptionState>, Error>;

    async fn mark_reminder_sent(&self, user_id: &str) -> Result<(), Error>;
}

/// Append-only usage ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Appends one usage row. Rows are never mutated or deleted.
    async fn append(&self, record: &UsageRecord) -> Result<(), Error>;

    /// Counts a user's rows for `action`, scoped to `period` when given.
    async fn count(
        &self,
        user_id: &str,
        action: ActionType,
        period: Option<&Period>,
    ) -> Result<u32, Error>;
}

pub(crate) fn is_expiring(state: &SubscriptionState, now: DateTime<Utc>) -> bool {
    match state.status {
        SubscriptionStatus::Trial => state.trial_ends_at.is_some_and(|t| t <= now),
        SubscriptionStatus::Active => state.subscription_ends_at.is_some_and(|t| t <= now),
        SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => false,
    }
}

pub(crate) fn needs_trial_reminder(
    state: &SubscriptionState,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    state.status == SubscriptionStatus::Trial
        && !state.trial_reminder_sent
        && state
            .trial_ends_at
            .is_some_and(|t| t > now && t <= now + window)
}
