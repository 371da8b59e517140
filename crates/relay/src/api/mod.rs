use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::{header::CONTENT_TYPE, HeaderValue},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use courier_common::types::UserId;
use serde::Serialize;
use tracing::debug;

use crate::{
    auth::{
        middleware::{require_bearer_auth, AuthenticatedUser},
        IdentityVerifier,
    },
    error::RelayError,
    metrics::RelayMetrics,
    ws::registry::ConnectionRegistry,
};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
struct ApiState {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
}

#[derive(Debug, Serialize)]
struct PresenceResponse {
    user_id: UserId,
    online: bool,
    connections: usize,
}

pub fn router(
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<RelayMetrics>,
    verifier: Arc<dyn IdentityVerifier>,
) -> Router {
    let state = ApiState { registry, metrics };

    let presence = Router::new()
        .route("/v1/presence/{user_id}", get(get_presence))
        .route_layer(middleware::from_fn_with_state(verifier, require_bearer_auth));

    Router::new().route("/metrics", get(render_metrics)).merge(presence).with_state(state)
}

async fn render_metrics(State(state): State<ApiState>) -> Response {
    let mut response = state.metrics.render_prometheus(&state.registry).into_response();
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE));
    response
}

async fn get_presence(
    State(state): State<ApiState>,
    Extension(caller): Extension<AuthenticatedUser>,
    Path(raw_user_id): Path<String>,
) -> Response {
    let Ok(user_id) = raw_user_id.parse::<UserId>() else {
        return RelayError::InvalidUserId { field: "user_id" }.into_response();
    };

    let connections = state.registry.connection_count(user_id);
    debug!(caller = %caller.user_id, user_id = %user_id, connections, "presence lookup");
    Json(PresenceResponse { user_id, online: connections > 0, connections }).into_response()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Request, StatusCode},
        Router,
    };
    use courier_common::types::UserId;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::router;
    use crate::{
        auth::jwt::JwtIdentityVerifier,
        metrics::RelayMetrics,
        ws::registry::{ConnectionHandle, ConnectionRegistry},
    };

    const TEST_SECRET: &str = "courier_test_secret_that_is_definitely_long_enough";

    struct Harness {
        app: Router,
        registry: Arc<ConnectionRegistry>,
        verifier: Arc<JwtIdentityVerifier>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ConnectionRegistry::default());
        let verifier =
            Arc::new(JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize"));
        let app = router(Arc::clone(&registry), Arc::new(RelayMetrics::default()), verifier.clone());
        Harness { app, registry, verifier }
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).expect("request should build")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        serde_json::from_slice(&bytes).expect("response body should be json")
    }

    #[tokio::test]
    async fn presence_requires_bearer_token() {
        let harness = harness();

        let response = harness
            .app
            .oneshot(get("/v1/presence/2", None))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["code"], "AUTH_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn presence_rejects_non_integer_user_id() {
        let harness = harness();
        let token = harness.verifier.issue_token(UserId(1)).expect("token should issue");

        let response = harness
            .app
            .oneshot(get("/v1/presence/alice", Some(&token)))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
        assert_eq!(body["error"]["details"]["field"], "user_id");
    }

    #[tokio::test]
    async fn presence_reports_live_connections() {
        let harness = harness();
        let token = harness.verifier.issue_token(UserId(1)).expect("token should issue");
        let (sender, _receiver) = mpsc::channel(1);
        harness.registry.register(UserId(2), ConnectionHandle::new(sender.clone()));
        harness.registry.register(UserId(2), ConnectionHandle::new(sender));

        let response = harness
            .app
            .clone()
            .oneshot(get("/v1/presence/2", Some(&token)))
            .await
            .expect("request should return a response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["user_id"], 2);
        assert_eq!(body["online"], true);
        assert_eq!(body["connections"], 2);

        let response = harness
            .app
            .oneshot(get("/v1/presence/3", Some(&token)))
            .await
            .expect("request should return a response");
        let body = body_json(response).await;
        assert_eq!(body["online"], false);
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn metrics_are_public_prometheus_text() {
        let harness = harness();

        let response = harness
            .app
            .oneshot(get("/metrics", None))
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"]
            .to_str()
            .expect("content type should be ascii")
            .starts_with("text/plain"));
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        let text = String::from_utf8(bytes.to_vec()).expect("metrics should be utf8");
        assert!(text.contains("# TYPE relay_online_users gauge"));
    }
}
