use axum::extract::{Extension, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::auth::Identity;
use crate::endpoints::{usage_after, UsageSnapshot};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, StructuredJson};
use crate::ledger::ActionType;
use crate::provider::ProfileAnalysis;
use crate::quota::Decision;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    pub profile: String,
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub analysis: ProfileAnalysis,
    pub usage: UsageSnapshot,
}

/// POST /v1/analysis/profile
#[instrument(skip_all)]
pub async fn analysis_handler(
    State(state): AppState,
    Extension(identity): Extension<Identity>,
    Extension(decision): Extension<Decision>,
    StructuredJson(params): StructuredJson<Params>,
) -> Result<Json<AnalysisResponse>, Error> {
    let profile = params.profile.trim();
    if profile.is_empty() {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "profile must not be empty".to_string(),
        }));
    }

    let analysis = state.provider.analyze_profile(profile).await?;
    state
        .recorder
        .record(
            &identity,
            ActionType::ProfileAnalysis,
            json!({ "profileChars": profile.len() }),
        )
        .await;

    Ok(Json(AnalysisResponse {
        analysis,
        usage: usage_after(&decision),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gateway_util::AppStateData;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_analysis_scores_and_records() {
        let state = AppStateData::new(Arc::new(Config::default())).await.unwrap();
        let identity = Identity::User {
            user_id: "user-1".to_string(),
        };
        let decision = Decision::allow(1, 1, "trial");
        let profile = "Ten years of engineering experience across three \
                       startups, with skills in distributed systems and a \
                       track record of shipping."
            .to_string();

        let Json(response) = analysis_handler(
            State(state.clone()),
            Extension(identity),
            Extension(decision),
            StructuredJson(Params { profile }),
        )
        .await
        .unwrap();

        assert!(response.analysis.score <= 100);
        assert_eq!(response.usage.plan, "trial");
        assert_eq!(response.usage.remaining, 0);
        let count = state
            .ledger
            .count("user-1", ActionType::ProfileAnalysis, None)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_anonymous_analysis_lands_in_the_audit_trail() {
        let state = AppStateData::new(Arc::new(Config::default())).await.unwrap();
        let identity = Identity::Anonymous {
            ip_address: "203.0.113.9".to_string(),
        };
        let decision = Decision::allow(1, 1, "anonymous");

        let result = analysis_handler(
            State(state.clone()),
            Extension(identity),
            Extension(decision),
            StructuredJson(Params {
                profile: "A short profile with some experience listed.".to_string(),
            }),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(
            state
                .metrics
                .records_written
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_blank_profile_rejected() {
        let state = AppStateData::new(Arc::new(Config::default())).await.unwrap();
        let identity = Identity::User {
            user_id: "user-1".to_string(),
        };
        let decision = Decision::allow(1, 1, "trial");

        let error = analysis_handler(
            State(state),
            Extension(identity),
            Extension(decision),
            StructuredJson(Params {
                profile: "\n\t".to_string(),
            }),
        )
        .await
        .unwrap_err();

        assert_eq!(error.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }
}
