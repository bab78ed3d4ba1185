use axum::extract::OriginalUri;
use axum::http::Method;
use axum::response::{IntoResponse, Response};

use crate::error::{Error, ErrorDetails};

/// Registered as the router fallback so unknown paths produce a structured
/// error body instead of axum's empty 404.
pub async fn handle_404(OriginalUri(uri): OriginalUri, method: Method) -> Response {
    Error::new(ErrorDetails::RouteNotFound {
        path: uri.path().to_string(),
        method: method.to_string(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{StatusCode, Uri};

    #[tokio::test]
    async fn test_unknown_route_is_structured_404() {
        let uri: Uri = "/v1/nonexistent".parse().unwrap();
        let response = handle_404(OriginalUri(uri), Method::POST).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
