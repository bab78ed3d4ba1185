use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub mod evaluator;
pub mod middleware;
pub mod recorder;

pub use evaluator::QuotaEvaluator;
pub use middleware::quota_gate_middleware;
pub use recorder::UsageRecorder;

/// Plan label reported when evaluation failed open. Dashboards alert on it.
pub const FAIL_OPEN_PLAN: &str = "error";

/// Outcome of a quota evaluation. Serialized verbatim into 429 bodies and
/// into the usage block of successful billable responses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    /// Slots left before this action runs. An allowed decision always has
    /// `remaining >= 1`; the action now executing consumes one of them.
    pub remaining: u32,
    pub limit: u32,
    pub plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

impl Decision {
    pub fn allow(remaining: u32, limit: u32, plan: impl Into<String>) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            plan: plan.into(),
            message: None,
            redirect_to: None,
        }
    }

    pub fn deny(
        limit: u32,
        plan: impl Into<String>,
        message: impl Into<String>,
        redirect_to: Option<String>,
    ) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            plan: plan.into(),
            message: Some(message.into()),
            redirect_to,
        }
    }

    /// Store trouble never blocks a billable action. The sentinel plan keeps
    /// fail-open responses distinguishable from real allowances.
    pub fn fail_open() -> Self {
        Self {
            allowed: true,
            remaining: 0,
            limit: 0,
            plan: FAIL_OPEN_PLAN.to_string(),
            message: None,
            redirect_to: None,
        }
    }

    pub fn failed_open(&self) -> bool {
        self.plan == FAIL_OPEN_PLAN
    }
}

/// Counters for the quota path. The atomics back the `/status` snapshot; the
/// `metrics` counters feed the Prometheus exporter.
#[derive(Debug, Default)]
pub struct QuotaMetrics {
    pub allowed: AtomicU64,
    pub denied: AtomicU64,
    pub failed_open: AtomicU64,
    pub records_written: AtomicU64,
    pub records_dropped: AtomicU64,
}

impl QuotaMetrics {
    pub fn record_allowed(&self, plan: &str) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
        let labels = vec![("outcome", "allowed".to_string()), ("plan", plan.to_string())];
        counter!("quota_decisions_total", &labels).increment(1);
    }

    pub fn record_denied(&self, plan: &str) {
        self.denied.fetch_add(1, Ordering::Relaxed);
        let labels = vec![("outcome", "denied".to_string()), ("plan", plan.to_string())];
        counter!("quota_decisions_total", &labels).increment(1);
    }

    pub fn record_failed_open(&self) {
        self.failed_open.fetch_add(1, Ordering::Relaxed);
        let labels = vec![
            ("outcome", "failed_open".to_string()),
            ("plan", FAIL_OPEN_PLAN.to_string()),
        ];
        counter!("quota_decisions_total", &labels).increment(1);
    }

    pub fn record_written(&self) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
        counter!("usage_records_total", &[("outcome", "written".to_string())]).increment(1);
    }

    pub fn record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
        counter!("usage_records_total", &[("outcome", "dropped".to_string())]).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_allowed_decision_omits_denial_fields() {
        let decision = Decision::allow(4, 5, "starter");
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(
            value,
            json!({"allowed": true, "remaining": 4, "limit": 5, "plan": "starter"})
        );
    }

    #[test]
    fn test_denied_decision_serializes_camel_case() {
        let decision = Decision::deny(
            5,
            "trial",
            "You've used all your free trial credits. Upgrade to Starter to continue.",
            Some("/pricing?plan=starter".to_string()),
        );
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["allowed"], json!(false));
        assert_eq!(value["remaining"], json!(0));
        assert_eq!(value["redirectTo"], json!("/pricing?plan=starter"));
    }

    #[test]
    fn test_fail_open_is_marked() {
        let decision = Decision::fail_open();
        assert!(decision.allowed);
        assert!(decision.failed_open());
        assert_eq!(decision.plan, "error");
    }

    #[test]
    fn test_metrics_snapshot_counts() {
        let metrics = QuotaMetrics::default();
        metrics.record_allowed("trial");
        metrics.record_allowed("pro");
        metrics.record_denied("trial");
        metrics.record_failed_open();
        assert_eq!(metrics.allowed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.denied.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.failed_open.load(Ordering::Relaxed), 1);
    }
}
