use serde::Serialize;

use crate::quota::Decision;

pub mod analysis;
pub mod fallback;
pub mod generate;
pub mod status;
pub mod subscription;
pub mod webhook;

/// Post-action usage view embedded in billable responses. The decision's
/// `remaining` was read before the action ran, so the snapshot subtracts the
/// action itself.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub plan: String,
    pub limit: u32,
    pub remaining: u32,
}

pub(crate) fn usage_after(decision: &Decision) -> UsageSnapshot {
    UsageSnapshot {
        plan: decision.plan.clone(),
        limit: decision.limit,
        remaining: decision.remaining.saturating_sub(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_snapshot_counts_the_action_just_taken() {
        let snapshot = usage_after(&Decision::allow(5, 30, "starter"));
        assert_eq!(snapshot.remaining, 4);
        assert_eq!(snapshot.limit, 30);
        assert_eq!(snapshot.plan, "starter");
    }

    #[test]
    fn test_usage_snapshot_saturates_instead_of_wrapping() {
        let snapshot = usage_after(&Decision::fail_open());
        assert_eq!(snapshot.remaining, 0);
        assert_eq!(snapshot.limit, 0);
    }
}
