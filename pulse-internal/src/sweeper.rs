use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::notify::{self, EmailTemplate, Notifier};
use crate::plan::PlanPolicy;
use crate::storage::AccountStore;
use crate::subscription::{SubscriptionEvent, SubscriptionStatus};

/// What one sweep pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub expired_trials: usize,
    pub expired_subscriptions: usize,
    pub reminders_sent: usize,
}

/// Background lifecycle pass: expires trials and lapsed subscriptions, and
/// reminds trials that are about to end. Holds no request-path state; every
/// pass re-reads from the store.
pub struct Sweeper {
    accounts: Arc<dyn AccountStore>,
    notifier: Arc<dyn Notifier>,
    policy: Arc<PlanPolicy>,
    reminder_window: Duration,
}

impl Sweeper {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        notifier: Arc<dyn Notifier>,
        policy: Arc<PlanPolicy>,
        reminder_window: Duration,
    ) -> Self {
        Self {
            accounts,
            notifier,
            policy,
            reminder_window,
        }
    }

    /// One pass as of `now`: expiries first, then reminders. Store errors
    /// are logged and the pass moves on; the next tick retries naturally.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        match self.accounts.find_expiring(now).await {
            Ok(due) => {
                for mut state in due {
                    let event = match state.status {
                        SubscriptionStatus::Trial => SubscriptionEvent::TrialElapsed,
                        SubscriptionStatus::Active => SubscriptionEvent::RenewalFailed,
                        SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => continue,
                    };
                    let Some(next) = state.apply_event(&event, &self.policy, now) else {
                        continue;
                    };
                    if let Err(e) = self.accounts.put(state.clone()).await {
                        error!("Failed to persist expiry for user {}: {e}", state.user_id);
                        continue;
                    }
                    debug!("Subscription for user {} moved to {next}", state.user_id);
                    if event == SubscriptionEvent::TrialElapsed {
                        outcome.expired_trials += 1;
                        notify::dispatch(
                            Arc::clone(&self.notifier),
                            state.user_id.clone(),
                            EmailTemplate::TrialExpired,
                            serde_json::json!({ "plan": state.plan }),
                        );
                    } else {
                        outcome.expired_subscriptions += 1;
                    }
                }
            }
            Err(e) => error!("Expiry scan failed: {e}"),
        }

        match self
            .accounts
            .find_trials_ending_within(now, self.reminder_window)
            .await
        {
            Ok(ending) => {
                for state in ending {
                    // Flag before sending: a crash in between costs one
                    // reminder, never a duplicate.
                    if let Err(e) = self.accounts.mark_reminder_sent(&state.user_id).await {
                        error!("Failed to flag reminder for user {}: {e}", state.user_id);
                        continue;
                    }
                    outcome.reminders_sent += 1;
                    let days_left = state
                        .trial_ends_at
                        .map(|ends| (ends - now).num_days())
                        .unwrap_or(0);
                    notify::dispatch(
                        Arc::clone(&self.notifier),
                        state.user_id.clone(),
                        EmailTemplate::TrialEndingSoon,
                        serde_json::json!({ "daysLeft": days_left }),
                    );
                }
            }
            Err(e) => error!("Trial reminder scan failed: {e}"),
        }

        outcome
    }

    /// Spawns the periodic sweep. Missed ticks are skipped rather than
    /// bunched after a stall.
    pub fn spawn(self: Arc<Self>, period: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep_interval = interval(period);
            sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Subscription sweep running every {period:?}");
            loop {
                sweep_interval.tick().await;
                let outcome = self.run_once(Utc::now()).await;
                if outcome != SweepOutcome::default() {
                    info!(
                        "Sweep expired {} trials and {} subscriptions, sent {} reminders",
                        outcome.expired_trials,
                        outcome.expired_subscriptions,
                        outcome.reminders_sent
                    );
                }
            }
        })
    }
}
