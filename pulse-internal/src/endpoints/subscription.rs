use axum::extract::{Extension, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::instrument;

use crate::auth::Identity;
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData};
use crate::ledger::{ActionType, Period};
use crate::plan::{PeriodKind, Plan};
use crate::subscription::{SubscriptionEvent, SubscriptionState, SubscriptionStatus};

/// These endpoints describe a user's account, so an anonymous caller has
/// nothing to look at.
fn require_user(identity: &Identity) -> Result<&str, Error> {
    identity.user_id().ok_or_else(|| {
        Error::new(ErrorDetails::Unauthenticated {
            message: "This endpoint requires an API key".to_string(),
        })
    })
}

/// The stored state, materializing the default trial on first touch. Same
/// upsert the quota gate uses, so both paths agree on who exists.
async fn materialize(state: &AppStateData, user_id: &str) -> Result<SubscriptionState, Error> {
    let default = SubscriptionState::new_trial(
        user_id,
        state.config.trial.duration_days,
        &state.policy,
    );
    state.accounts.ensure_default(default).await
}

/// GET /v1/subscription
#[instrument(skip_all)]
pub async fn get_subscription_handler(
    State(state): AppState,
    Extension(identity): Extension<Identity>,
) -> Result<Json<SubscriptionState>, Error> {
    let user_id = require_user(&identity)?;
    Ok(Json(materialize(&state, user_id).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionUsage {
    pub action: ActionType,
    pub limit: u32,
    pub period: PeriodKind,
    pub used: u32,
    pub remaining: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub period: Period,
    pub actions: Vec<ActionUsage>,
}

/// GET /v1/subscription/usage
#[instrument(skip_all)]
pub async fn usage_handler(
    State(state): AppState,
    Extension(identity): Extension<Identity>,
) -> Result<Json<UsageSummary>, Error> {
    let user_id = require_user(&identity)?;
    usage_summary(&state, user_id, Utc::now()).await.map(Json)
}

/// Counts from the ledger, the same source the quota gate reads, so the
/// numbers shown here match the decisions being made.
async fn usage_summary(
    state: &AppStateData,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<UsageSummary, Error> {
    let stored = materialize(state, user_id).await?;
    let period = Period::of(now);

    let mut actions = Vec::with_capacity(4);
    for action in ActionType::iter() {
        let limit = state.policy.limits_for(stored.plan, stored.status, action);
        let scope = match limit.period {
            PeriodKind::Monthly => Some(&period),
            PeriodKind::Total => None,
        };
        let used = state.ledger.count(user_id, action, scope).await?;
        actions.push(ActionUsage {
            action,
            limit: limit.limit,
            period: limit.period,
            used,
            remaining: limit.limit.saturating_sub(used),
        });
    }

    Ok(UsageSummary {
        plan: stored.plan,
        status: stored.status,
        period,
        actions,
    })
}

/// POST /v1/subscription/cancel
///
/// Only active subscriptions cancel; trials just run out. The transition
/// table is the source of truth, this handler only translates its `None`
/// into a client error.
#[instrument(skip_all)]
pub async fn cancel_handler(
    State(state): AppState,
    Extension(identity): Extension<Identity>,
) -> Result<Json<SubscriptionState>, Error> {
    let user_id = require_user(&identity)?;
    let mut stored = state.accounts.get(user_id).await?.ok_or_else(|| {
        Error::new(ErrorDetails::InvalidRequest {
            message: "no subscription on file to cancel".to_string(),
        })
    })?;

    let status = stored.status;
    match stored.apply_event(&SubscriptionEvent::CancelRequested, &state.policy, Utc::now()) {
        Some(_) => {
            state.accounts.put(stored.clone()).await?;
            Ok(Json(stored))
        }
        None => Err(Error::new(ErrorDetails::InvalidRequest {
            message: format!("a {status} subscription cannot be cancelled"),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::StatusCode;
    use serde_json::Value;
    use std::sync::Arc;

    fn user(user_id: &str) -> Identity {
        Identity::User {
            user_id: user_id.to_string(),
        }
    }

    async fn state() -> AppStateData {
        AppStateData::new(Arc::new(Config::default())).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_touch_materializes_a_trial() {
        let state = state().await;

        let Json(first) = get_subscription_handler(State(state.clone()), Extension(user("user-1")))
            .await
            .unwrap();
        assert_eq!(first.plan, Plan::Trial);
        assert_eq!(first.status, SubscriptionStatus::Trial);
        assert!(first.trial_ends_at.is_some());

        // Second read returns the stored row, not a fresh default.
        let Json(second) =
            get_subscription_handler(State(state), Extension(user("user-1")))
                .await
                .unwrap();
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_anonymous_caller_is_rejected() {
        let state = state().await;
        let identity = Identity::Anonymous {
            ip_address: "203.0.113.9".to_string(),
        };

        let error = get_subscription_handler(State(state), Extension(identity))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_usage_summary_counts_from_the_ledger() {
        let state = state().await;
        let identity = user("user-1");
        for _ in 0..2 {
            state
                .recorder
                .record(&identity, ActionType::Post, Value::Null)
                .await;
        }

        let summary = usage_summary(&state, "user-1", Utc::now()).await.unwrap();

        assert_eq!(summary.plan, Plan::Trial);
        let post = summary
            .actions
            .iter()
            .find(|a| a.action == ActionType::Post)
            .unwrap();
        assert_eq!(post.limit, 5);
        assert_eq!(post.used, 2);
        assert_eq!(post.remaining, 3);
        assert_eq!(post.period, PeriodKind::Total);

        let idea = summary
            .actions
            .iter()
            .find(|a| a.action == ActionType::Idea)
            .unwrap();
        assert_eq!(idea.used, 0);
        assert_eq!(idea.remaining, 5);
    }

    #[tokio::test]
    async fn test_cancel_needs_an_active_subscription() {
        let state = state().await;

        // Nothing stored yet.
        let error = cancel_handler(State(state.clone()), Extension(user("user-1")))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);

        // A trial is not cancellable; it just runs out.
        materialize(&state, "user-1").await.unwrap();
        let error = cancel_handler(State(state.clone()), Extension(user("user-1")))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert!(error.to_string().contains("trial"));

        // After payment the subscription is active and cancel lands.
        let mut stored = state.accounts.get("user-1").await.unwrap().unwrap();
        stored.apply_event(
            &SubscriptionEvent::PaymentSucceeded { plan: Plan::Pro },
            &state.policy,
            Utc::now(),
        );
        state.accounts.put(stored).await.unwrap();

        let Json(cancelled) = cancel_handler(State(state.clone()), Extension(user("user-1")))
            .await
            .unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);

        let persisted = state.accounts.get("user-1").await.unwrap().unwrap();
        assert_eq!(persisted.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_plan_reports_zeroed_limits() {
        let state = state().await;
        let mut stored = materialize(&state, "user-1").await.unwrap();
        stored.apply_event(
            &SubscriptionEvent::PaymentSucceeded { plan: Plan::Starter },
            &state.policy,
            Utc::now(),
        );
        stored.apply_event(&SubscriptionEvent::CancelRequested, &state.policy, Utc::now());
        state.accounts.put(stored).await.unwrap();

        let summary = usage_summary(&state, "user-1", Utc::now()).await.unwrap();
        assert_eq!(summary.status, SubscriptionStatus::Cancelled);
        for action in &summary.actions {
            assert_eq!(action.limit, 0);
            assert_eq!(action.remaining, 0);
        }
    }
}
