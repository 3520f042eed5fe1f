//! Request-id propagation: every request carries an id, available to error
//! responses and log lines without threading it through call signatures.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tokio::task_local;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

task_local! {
    static REQUEST_ID: String;
}

/// The id of the request currently being served, if any. Outside a request
/// scope (background workers, tests) this is `None`.
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// Runs `fut` with the given request id in scope. Used by the middleware and
/// by tests that assert on error-body metadata.
pub async fn scope<F: std::future::Future>(id: String, fut: F) -> F::Output {
    REQUEST_ID.scope(id, fut).await
}

/// Accepts an inbound `x-request-id` (so upstream gateways can correlate) or
/// mints one, scopes it for the duration of the request, and echoes it on the
/// response.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 64)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = scope(id.clone(), next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scoped_id_is_visible_and_cleared() {
        assert!(current_request_id().is_none());
        let seen = scope("req-42".into(), async { current_request_id() }).await;
        assert_eq!(seen.as_deref(), Some("req-42"));
        assert!(current_request_id().is_none());
    }
}
