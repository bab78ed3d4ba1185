use axum::extract::{Extension, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::auth::Identity;
use crate::endpoints::{usage_after, UsageSnapshot};
use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::ledger::ActionType;
use crate::quota::Decision;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub action: ActionType,
    pub content: String,
    pub usage: UsageSnapshot,
}

/// POST /v1/generate/post
#[instrument(skip_all)]
pub async fn post_handler(
    State(state): AppState,
    Extension(identity): Extension<Identity>,
    Extension(decision): Extension<Decision>,
    StructuredJson(params): StructuredJson<Params>,
) -> Result<Json<GenerateResponse>, Error> {
    run_generation(&state, &identity, &decision, ActionType::Post, params).await
}

/// POST /v1/generate/comment
#[instrument(skip_all)]
pub async fn comment_handler(
    State(state): AppState,
    Extension(identity): Extension<Identity>,
    Extension(decision): Extension<Decision>,
    StructuredJson(params): StructuredJson<Params>,
) -> Result<Json<GenerateResponse>, Error> {
    run_generation(&state, &identity, &decision, ActionType::Comment, params).await
}

/// POST /v1/generate/idea
#[instrument(skip_all)]
pub async fn idea_handler(
    State(state): AppState,
    Extension(identity): Extension<Identity>,
    Extension(decision): Extension<Decision>,
    StructuredJson(params): StructuredJson<Params>,
) -> Result<Json<GenerateResponse>, Error> {
    run_generation(&state, &identity, &decision, ActionType::Idea, params).await
}

/// Shared body of the three generation routes. The quota gate has already
/// allowed the action; usage is recorded only after the provider succeeds,
/// so a failed generation never burns a slot.
async fn run_generation(
    state: &AppStateData,
    identity: &Identity,
    decision: &Decision,
    action: ActionType,
    params: Params,
) -> Result<Json<GenerateResponse>, Error> {
    let prompt = params.prompt.trim();
    if prompt.is_empty() {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "prompt must not be empty".to_string(),
        }));
    }

    let content = state.provider.generate(action, prompt).await?;
    state
        .recorder
        .record(identity, action, json!({ "promptChars": prompt.len() }))
        .await;

    Ok(Json(GenerateResponse {
        action,
        content,
        usage: usage_after(decision),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    fn user() -> Identity {
        Identity::User {
            user_id: "user-1".to_string(),
        }
    }

    async fn state() -> AppStateData {
        AppStateData::new(Arc::new(Config::default())).await.unwrap()
    }

    #[tokio::test]
    async fn test_generation_records_usage_after_success() {
        let state = state().await;
        let decision = Decision::allow(5, 5, "trial");
        let params = Params {
            prompt: "a post about hiring".to_string(),
        };

        let Json(response) = run_generation(&state, &user(), &decision, ActionType::Post, params)
            .await
            .unwrap();

        assert_eq!(response.action, ActionType::Post);
        assert!(response.content.contains("a post about hiring"));
        assert_eq!(response.usage.remaining, 4);
        let count = state
            .ledger
            .count("user-1", ActionType::Post, None)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_blank_prompt_rejected_without_spending() {
        let state = state().await;
        let decision = Decision::allow(5, 5, "trial");
        let params = Params {
            prompt: "   ".to_string(),
        };

        let error = run_generation(&state, &user(), &decision, ActionType::Idea, params)
            .await
            .unwrap_err();

        assert_eq!(
            error.status_code(),
            axum::http::StatusCode::BAD_REQUEST
        );
        let count = state
            .ledger
            .count("user-1", ActionType::Idea, None)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_handlers_route_to_their_action() {
        let state = state().await;
        let decision = Decision::allow(10, 10, "starter");
        let Json(response) = comment_handler(
            State(state.clone()),
            Extension(user()),
            Extension(decision),
            StructuredJson(Params {
                prompt: "remote work".to_string(),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.action, ActionType::Comment);
        let count = state
            .ledger
            .count("user-1", ActionType::Comment, None)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
