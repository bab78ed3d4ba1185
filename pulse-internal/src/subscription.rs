use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::IntoEnumIterator;

use crate::ledger::{ActionType, Period};
use crate::plan::{ActionLimit, Plan, PlanPolicy};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Cancelled,
    Expired,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    PaymentSucceeded { plan: Plan },
    RenewalFailed,
    CancelRequested,
    TrialElapsed,
}

/// The lifecycle table. Every legal move is listed; anything else returns
/// `None` and the caller logs and ignores it. Cancelled and expired are
/// terminal.
pub fn transition(
    status: SubscriptionStatus,
    event: &SubscriptionEvent,
) -> Option<SubscriptionStatus> {
    match (status, event) {
        (SubscriptionStatus::Trial, SubscriptionEvent::PaymentSucceeded { .. }) => {
            Some(SubscriptionStatus::Active)
        }
        (SubscriptionStatus::Trial, SubscriptionEvent::TrialElapsed) => {
            Some(SubscriptionStatus::Expired)
        }
        (SubscriptionStatus::Active, SubscriptionEvent::CancelRequested) => {
            Some(SubscriptionStatus::Cancelled)
        }
        (SubscriptionStatus::Active, SubscriptionEvent::RenewalFailed) => {
            Some(SubscriptionStatus::Expired)
        }
        _ => None,
    }
}

/// Denormalized per-period counters. Advisory fast path for display; the
/// ledger stays authoritative for quota evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub period: Period,
    pub counts: HashMap<ActionType, u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionState {
    pub user_id: String,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub subscription_ends_at: Option<DateTime<Utc>>,
    pub usage: UsageCounters,
    /// Cached copy of the plan's policy rows, refreshed on plan transitions.
    pub limits: HashMap<ActionType, ActionLimit>,
    pub trial_reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn snapshot_limits(plan: Plan, policy: &PlanPolicy) -> HashMap<ActionType, ActionLimit> {
    ActionType::iter()
        .map(|action| (action, policy.limit_for(plan, action)))
        .collect()
}

impl SubscriptionState {
    pub fn new_trial(user_id: &str, trial_days: i64, policy: &PlanPolicy) -> Self {
        Self::new_trial_at(user_id, trial_days, policy, Utc::now())
    }

    pub fn new_trial_at(
        user_id: &str,
        trial_days: i64,
        policy: &PlanPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        SubscriptionState {
            user_id: user_id.to_string(),
            plan: Plan::Trial,
            status: SubscriptionStatus::Trial,
            trial_ends_at: Some(now + Duration::days(trial_days)),
            subscription_ends_at: None,
            usage: UsageCounters {
                period: Period::of(now),
                counts: HashMap::new(),
            },
            limits: snapshot_limits(Plan::Trial, policy),
            trial_reminder_sent: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies an event via the transition table. Returns the new status, or
    /// `None` when the event does not apply to the current status.
    pub fn apply_event(
        &mut self,
        event: &SubscriptionEvent,
        policy: &PlanPolicy,
        now: DateTime<Utc>,
    ) -> Option<SubscriptionStatus> {
        let next = transition(self.status, event)?;
        self.status = next;
        if let SubscriptionEvent::PaymentSucceeded { plan } = event {
            self.plan = *plan;
            self.limits = snapshot_limits(*plan, policy);
        }
        self.updated_at = now;
        Some(next)
    }

    /// Rolls the denormalized counters when the calendar month changes.
    pub fn reset_if_new_period(&mut self, now: DateTime<Utc>) {
        let current = Period::of(now);
        if self.usage.period != current {
            self.usage.period = current;
            self.usage.counts.clear();
        }
    }
}
