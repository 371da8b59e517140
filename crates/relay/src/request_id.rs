// Per-request correlation id, carried in a task-local so handlers, error
// responses and WebSocket sessions all log under the id that the HTTP layer
// returned in `x-request-id`.

use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue},
    response::Response,
};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

pub async fn scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

/// The client's `x-request-id` when it sent a non-blank one, else a fresh uuid.
pub fn from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};

    use super::{current, from_headers_or_generate, scope, REQUEST_ID_HEADER};

    #[test]
    fn client_id_is_reused_and_blank_ids_are_replaced() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("client-req-1"));
        assert_eq!(from_headers_or_generate(&headers), "client-req-1");

        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("  "));
        let generated = from_headers_or_generate(&headers);
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }

    #[tokio::test]
    async fn id_is_visible_only_inside_its_scope() {
        assert_eq!(current(), None);
        let seen = scope("req-7".to_owned(), async { current() }).await;
        assert_eq!(seen.as_deref(), Some("req-7"));
    }
}
