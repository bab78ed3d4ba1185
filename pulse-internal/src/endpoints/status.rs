use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;

use crate::gateway_util::AppState;

/// The version of the crate, set at compile time.
pub const PULSE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    version: String,
    quota: QuotaSnapshot,
}

#[derive(Debug, Serialize)]
struct QuotaSnapshot {
    allowed: u64,
    denied: u64,
    failed_open: u64,
    records_written: u64,
    records_dropped: u64,
}

/// GET /status: liveness plus a coarse decision-counter snapshot. The full
/// labeled series live on /metrics.
pub async fn status_handler(State(state): AppState) -> Json<StatusResponse> {
    let metrics = &state.metrics;
    Json(StatusResponse {
        version: PULSE_VERSION.to_string(),
        quota: QuotaSnapshot {
            allowed: metrics.allowed.load(Ordering::Relaxed),
            denied: metrics.denied.load(Ordering::Relaxed),
            failed_open: metrics.failed_open.load(Ordering::Relaxed),
            records_written: metrics.records_written.load(Ordering::Relaxed),
            records_dropped: metrics.records_dropped.load(Ordering::Relaxed),
        },
    })
}

/// GET /health
pub async fn health_handler() -> Json<Value> {
    Json(json!({ "gateway": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gateway_util::AppStateData;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_status_reports_version_and_counters() {
        let state = AppStateData::new(Arc::new(Config::default())).await.unwrap();
        state.metrics.record_allowed("trial");
        state.metrics.record_denied("trial");

        let Json(response) = status_handler(State(state)).await;
        assert_eq!(response.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(response.quota.allowed, 1);
        assert_eq!(response.quota.denied, 1);
        assert_eq!(response.quota.failed_open, 0);
    }

    #[tokio::test]
    async fn test_health_is_static() {
        let Json(body) = health_handler().await;
        assert_eq!(body, json!({ "gateway": "ok" }));
    }
}
