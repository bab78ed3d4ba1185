use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, ErrorDetails};
use crate::ledger::ActionType;
use crate::subscription::SubscriptionStatus;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Plan {
    Trial,
    Starter,
    Pro,
    Elite,
    Anonymous,
}

/// Lenient parser for plan names arriving from outside (webhook payloads,
/// stored state written by older versions). Unknown plans degrade to trial
/// with a warning rather than crashing or granting unlimited access.
pub fn parse_plan(value: &str) -> Plan {
    match value.parse::<Plan>() {
        Ok(plan) => plan,
        Err(_) => {
            tracing::warn!("Unknown plan `{value}`, falling back to trial");
            Plan::Trial
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    /// Counted over the lifetime of the identity.
    Total,
    /// Counted within the current calendar month.
    Monthly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLimit {
    pub limit: u32,
    pub period: PeriodKind,
}

/// The plan/action limit table. The baseline is an exhaustive match so a new
/// plan or action type fails to compile until it gets a row; config overrides
/// are validated at startup and never fall through to a runtime default.
#[derive(Debug, Default)]
pub struct PlanPolicy {
    overrides: HashMap<(Plan, ActionType), ActionLimit>,
}

impl PlanPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(
        overrides: &HashMap<String, HashMap<String, ActionLimit>>,
    ) -> Result<Self, Error> {
        let mut map = HashMap::new();
        for (plan_name, actions) in overrides {
            let plan: Plan = plan_name.parse().map_err(|_| {
                Error::new(ErrorDetails::InvalidPlan {
                    plan: plan_name.clone(),
                })
            })?;
            for (action_name, action_limit) in actions {
                let action: ActionType = action_name.parse().map_err(|_| {
                    Error::new(ErrorDetails::Config {
                        message: format!(
                            "Unknown action type `{action_name}` in [plans.{plan_name}]"
                        ),
                    })
                })?;
                map.insert((plan, action), *action_limit);
            }
        }
        Ok(Self { overrides: map })
    }

    fn default_limit(plan: Plan, action: ActionType) -> ActionLimit {
        let (limit, period) = match (plan, action) {
            (Plan::Anonymous, ActionType::ProfileAnalysis) => (1, PeriodKind::Total),
            (Plan::Anonymous, ActionType::Post) => (0, PeriodKind::Total),
            (Plan::Anonymous, ActionType::Comment) => (0, PeriodKind::Total),
            (Plan::Anonymous, ActionType::Idea) => (0, PeriodKind::Total),
            (Plan::Trial, ActionType::ProfileAnalysis) => (1, PeriodKind::Total),
            (Plan::Trial, ActionType::Post) => (5, PeriodKind::Total),
            (Plan::Trial, ActionType::Comment) => (10, PeriodKind::Total),
            (Plan::Trial, ActionType::Idea) => (5, PeriodKind::Total),
            (Plan::Starter, ActionType::ProfileAnalysis) => (5, PeriodKind::Monthly),
            (Plan::Starter, ActionType::Post) => (30, PeriodKind::Monthly),
            (Plan::Starter, ActionType::Comment) => (100, PeriodKind::Monthly),
            (Plan::Starter, ActionType::Idea) => (30, PeriodKind::Monthly),
            (Plan::Pro, ActionType::ProfileAnalysis) => (25, PeriodKind::Monthly),
            (Plan::Pro, ActionType::Post) => (150, PeriodKind::Monthly),
            (Plan::Pro, ActionType::Comment) => (500, PeriodKind::Monthly),
            (Plan::Pro, ActionType::Idea) => (150, PeriodKind::Monthly),
            (Plan::Elite, ActionType::ProfileAnalysis) => (100, PeriodKind::Monthly),
            (Plan::Elite, ActionType::Post) => (1000, PeriodKind::Monthly),
            (Plan::Elite, ActionType::Comment) => (3000, PeriodKind::Monthly),
            (Plan::Elite, ActionType::Idea) => (1000, PeriodKind::Monthly),
        };
        ActionLimit { limit, period }
    }

    pub fn limit_for(&self, plan: Plan, action: ActionType) -> ActionLimit {
        self.overrides
            .get(&(plan, action))
            .copied()
            .unwrap_or_else(|| Self::default_limit(plan, action))
    }

    /// Status-aware lookup: cancelled and expired subscriptions lose every
    /// billable action immediately, whatever the plan says.
    pub fn limits_for(
        &self,
        plan: Plan,
        status: SubscriptionStatus,
        action: ActionType,
    ) -> ActionLimit {
        let base = self.limit_for(plan, action);
        match status {
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => ActionLimit {
                limit: 0,
                period: base.period,
            },
            SubscriptionStatus::Trial | SubscriptionStatus::Active => base,
        }
    }
}

/// Upgrade destination when a caller runs out of quota.
pub fn upsell_route(plan: Plan) -> &'static str {
    match plan {
        Plan::Anonymous => "/signup",
        Plan::Trial => "/pricing?plan=starter",
        Plan::Starter => "/pricing?plan=pro",
        Plan::Pro => "/pricing?plan=elite",
        Plan::Elite => "/pricing",
    }
}

pub fn upsell_message(plan: Plan) -> &'static str {
    match plan {
        Plan::Anonymous => "Sign up for a free trial to continue.",
        Plan::Trial => {
            "You've used all your free trial credits. Upgrade to Starter to continue."
        }
        Plan::Starter => {
            "You've reached your Starter plan limit for this month. Upgrade to Pro for higher limits."
        }
        Plan::Pro => {
            "You've reached your Pro plan limit for this month. Upgrade to Elite for higher limits."
        }
        Plan::Elite => {
            "You've reached your Elite plan limit for this month. Contact us if you need more."
        }
    }
}
