use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

use crate::state::AppState;

/// Header used by Azure-style clients instead of `Authorization`.
pub const API_KEY_HEADER: &str = "api-key";

/// Rejects API requests that do not present the configured key.  Open when
/// no key is configured.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_key.as_deref() else {
        return next.run(req).await;
    };
    if presented_key(req.headers()) == Some(expected) {
        return next.run(req).await;
    }
    warn!(path = %req.uri().path(), "request rejected: missing or wrong API key");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorised" })),
    )
        .into_response()
}

/// `Authorization: Bearer <key>`, else the `api-key` header.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        return value.to_str().ok()?.strip_prefix("Bearer ").map(str::trim);
    }
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_token_wins_over_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(presented_key(&headers), Some("from-header"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert_eq!(presented_key(&headers), Some("s3cret"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(presented_key(&headers), None);
    }
}
