use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::auth::Identity;
use crate::error::{Error, ErrorDetails};
use crate::ledger::{ActionType, Period};
use crate::plan::{upsell_message, upsell_route, PeriodKind, Plan, PlanPolicy};
use crate::quota::{Decision, QuotaMetrics};
use crate::rate_limit::AnonymousRateStore;
use crate::storage::{AccountStore, LedgerStore};
use crate::subscription::SubscriptionState;

/// Knobs the evaluator takes from configuration.
#[derive(Clone, Copy, Debug)]
pub struct QuotaSettings {
    pub trial_days: i64,
    pub anonymous_window: Duration,
    pub anonymous_max: u32,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            trial_days: 7,
            anonymous_window: Duration::hours(24),
            anonymous_max: 1,
        }
    }
}

/// Decides whether an identity may perform a billable action right now.
///
/// Authenticated checks are reads (plus the idempotent trial upsert for
/// first-timers); consumption happens later through the recorder, so a burst
/// of near-limit requests can overshoot by the number in flight. Anonymous
/// checks consume their window slot here, atomically, because nothing records
/// for them afterwards.
pub struct QuotaEvaluator {
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn LedgerStore>,
    anonymous: Arc<dyn AnonymousRateStore>,
    policy: Arc<PlanPolicy>,
    metrics: Arc<QuotaMetrics>,
    settings: QuotaSettings,
}

impl QuotaEvaluator {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn LedgerStore>,
        anonymous: Arc<dyn AnonymousRateStore>,
        policy: Arc<PlanPolicy>,
        metrics: Arc<QuotaMetrics>,
        settings: QuotaSettings,
    ) -> Self {
        Self {
            accounts,
            ledger,
            anonymous,
            policy,
            metrics,
            settings,
        }
    }

    pub async fn evaluate(
        &self,
        identity: &Identity,
        action: ActionType,
    ) -> Result<Decision, Error> {
        self.evaluate_at(identity, action, Utc::now()).await
    }

    /// The only `Err` this returns is `IdentityMissing`; store trouble fails
    /// open instead of surfacing.
    pub async fn evaluate_at(
        &self,
        identity: &Identity,
        action: ActionType,
        now: DateTime<Utc>,
    ) -> Result<Decision, Error> {
        match identity {
            Identity::Anonymous { ip_address } => {
                if ip_address.trim().is_empty() {
                    return Err(Error::new(ErrorDetails::IdentityMissing {
                        message: "anonymous identity carried a blank ip address".to_string(),
                    }));
                }
                Ok(self.evaluate_anonymous(ip_address, action, now).await)
            }
            Identity::User { user_id } => {
                if user_id.trim().is_empty() {
                    return Err(Error::new(ErrorDetails::IdentityMissing {
                        message: "authenticated identity carried a blank user id".to_string(),
                    }));
                }
                Ok(self.evaluate_user(user_id, action, now).await)
            }
        }
    }

    /// The policy table decides which actions are open to anonymous callers;
    /// the configured window cap decides how many fit in one window.
    async fn evaluate_anonymous(
        &self,
        ip_address: &str,
        action: ActionType,
        now: DateTime<Utc>,
    ) -> Decision {
        let plan = Plan::Anonymous;
        let opened = self.policy.limit_for(plan, action).limit > 0;
        if !opened || self.settings.anonymous_max == 0 {
            return self.deny(0, plan);
        }

        let max = self.settings.anonymous_max;
        let verdict = self
            .anonymous
            .check_and_increment(ip_address, max, self.settings.anonymous_window, now)
            .await;
        match verdict {
            Ok(verdict) if verdict.allowed => {
                // The verdict count already includes this action.
                let remaining = max.saturating_sub(verdict.count.saturating_sub(1));
                self.metrics.record_allowed("anonymous");
                Decision::allow(remaining, max, plan.to_string())
            }
            Ok(_) => self.deny(max, plan),
            Err(e) => {
                warn!("Anonymous quota check for {ip_address} failing open: {e}");
                self.metrics.record_failed_open();
                Decision::fail_open()
            }
        }
    }

    async fn evaluate_user(
        &self,
        user_id: &str,
        action: ActionType,
        now: DateTime<Utc>,
    ) -> Decision {
        let default =
            SubscriptionState::new_trial_at(user_id, self.settings.trial_days, &self.policy, now);
        let state = match self.accounts.ensure_default(default).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Quota evaluation for user {user_id} failing open: {e}");
                self.metrics.record_failed_open();
                return Decision::fail_open();
            }
        };

        let spec = self.policy.limits_for(state.plan, state.status, action);
        if spec.limit == 0 {
            return self.deny(0, state.plan);
        }

        let period = Period::of(now);
        let scope = match spec.period {
            PeriodKind::Monthly => Some(&period),
            PeriodKind::Total => None,
        };
        let count = match self.ledger.count(user_id, action, scope).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Usage count for user {user_id} failing open: {e}");
                self.metrics.record_failed_open();
                return Decision::fail_open();
            }
        };

        let remaining = spec.limit.saturating_sub(count);
        if remaining > 0 {
            self.metrics.record_allowed(&state.plan.to_string());
            Decision::allow(remaining, spec.limit, state.plan.to_string())
        } else {
            self.deny(spec.limit, state.plan)
        }
    }

    fn deny(&self, limit: u32, plan: Plan) -> Decision {
        self.metrics.record_denied(&plan.to_string());
        Decision::deny(
            limit,
            plan.to_string(),
            upsell_message(plan),
            Some(upsell_route(plan).to_string()),
        )
    }
}
