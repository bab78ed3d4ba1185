use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::plan::{parse_plan, Plan};
use crate::subscription::{SubscriptionEvent, SubscriptionState};

/// Billing cycle assumed when the processor omits the period end.
const DEFAULT_BILLING_CYCLE_DAYS: i64 = 30;

/// What the payment processor posts. Processors attach extra fields freely,
/// so unknown keys pass through instead of failing the delivery.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWebhookParams {
    pub event: String,
    pub user_id: String,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub period_ends_at: Option<DateTime<Utc>>,
}

/// POST /v1/webhooks/payment
///
/// Unknown events and illegal transitions acknowledge with
/// `{"status": "ignored"}` so the processor stops retrying them. Store
/// failures return 5xx so the processor retries later.
#[instrument(skip_all)]
pub async fn payment_webhook_handler(
    State(state): AppState,
    StructuredJson(params): StructuredJson<PaymentWebhookParams>,
) -> Result<Json<Value>, Error> {
    handle_payment_event(&state, params, Utc::now())
        .await
        .map(Json)
}

fn ignored() -> Value {
    json!({ "status": "ignored" })
}

async fn handle_payment_event(
    state: &AppStateData,
    params: PaymentWebhookParams,
    now: DateTime<Utc>,
) -> Result<Value, Error> {
    if params.user_id.trim().is_empty() {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "userId must not be empty".to_string(),
        }));
    }
    let user_id = params.user_id.as_str();

    let event = match params.event.as_str() {
        "payment_succeeded" => {
            let plan = match params.plan.as_deref() {
                Some(name) => parse_plan(name),
                None => {
                    warn!("Payment event for user {user_id} carries no plan, assuming trial");
                    Plan::Trial
                }
            };
            SubscriptionEvent::PaymentSucceeded { plan }
        }
        "renewal_failed" => SubscriptionEvent::RenewalFailed,
        "cancelled" => SubscriptionEvent::CancelRequested,
        other => {
            warn!("Ignoring unknown payment event `{other}` for user {user_id}");
            return Ok(ignored());
        }
    };

    let stored = state.accounts.get(user_id).await?;
    let mut subscription = match stored {
        Some(subscription) => subscription,
        // A payment for a user we have never seen still creates the account.
        // Other events for unknown users have nothing to act on.
        None if matches!(event, SubscriptionEvent::PaymentSucceeded { .. }) => {
            let default = SubscriptionState::new_trial_at(
                user_id,
                state.config.trial.duration_days,
                &state.policy,
                now,
            );
            state.accounts.ensure_default(default).await?
        }
        None => {
            warn!(
                "Ignoring `{}` for unknown user {user_id}",
                params.event
            );
            return Ok(ignored());
        }
    };

    let Some(next) = subscription.apply_event(&event, &state.policy, now) else {
        let status = subscription.status;
        warn!(
            "Ignoring `{}`: a {status} subscription does not accept it",
            params.event
        );
        return Ok(ignored());
    };

    if matches!(event, SubscriptionEvent::PaymentSucceeded { .. }) {
        subscription.subscription_ends_at = Some(
            params
                .period_ends_at
                .unwrap_or_else(|| now + Duration::days(DEFAULT_BILLING_CYCLE_DAYS)),
        );
        subscription.trial_ends_at = None;
    }
    state.accounts.put(subscription.clone()).await?;

    info!("Subscription for user {user_id} moved to {next}");
    Ok(json!({ "status": "ok", "subscription": subscription }))
}
