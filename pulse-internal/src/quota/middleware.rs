use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::debug;

use crate::auth::Identity;
use crate::error::{Error, ErrorDetails, IMPOSSIBLE_ERROR_MESSAGE};
use crate::ledger::ActionType;
use crate::quota::{Decision, QuotaEvaluator};

/// Maps a billable route to the action it spends. Routes not listed here
/// pass through the gate untouched.
pub(crate) fn action_for_path(path: &str) -> Option<ActionType> {
    match path {
        "/v1/analysis/profile" => Some(ActionType::ProfileAnalysis),
        "/v1/generate/post" => Some(ActionType::Post),
        "/v1/generate/comment" => Some(ActionType::Comment),
        "/v1/generate/idea" => Some(ActionType::Idea),
        _ => None,
    }
}

/// Gate in front of the billable routes. Runs after identity resolution,
/// denies with a 429 carrying the full decision, and stashes allowed
/// decisions in request extensions for the handler's usage snapshot.
pub async fn quota_gate_middleware(
    State(evaluator): State<Arc<QuotaEvaluator>>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let Some(action) = action_for_path(request.uri().path()) else {
        return Ok(next.run(request).await);
    };

    let Some(identity) = request.extensions().get::<Identity>().cloned() else {
        let error = Error::new(ErrorDetails::IdentityMissing {
            message: format!(
                "no identity resolved before the quota gate. {IMPOSSIBLE_ERROR_MESSAGE}"
            ),
        });
        return Err(error.into_response());
    };

    let decision = match evaluator.evaluate(&identity, action).await {
        Ok(decision) => decision,
        Err(e) => return Err(e.into_response()),
    };

    if !decision.allowed {
        return Err(denial_response(decision));
    }

    debug!(
        "Quota check passed for {action}: {} of {} remaining",
        decision.remaining, decision.limit
    );
    request.extensions_mut().insert(decision);
    Ok(next.run(request).await)
}

/// 429 with the decision as the body plus usage headers.
pub(crate) fn denial_response(decision: Decision) -> Response {
    let limit = decision.limit;
    let remaining = decision.remaining;
    let mut response = Error::new(ErrorDetails::QuotaExceeded { decision }).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("x-usage-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("x-usage-remaining", value);
    }
    response
}
