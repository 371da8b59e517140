pub mod registry;
pub mod relay;
pub mod session;


use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{rejection::QueryRejection, Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};

use self::{registry::ConnectionRegistry, session::SessionSettings};
use crate::{
    auth::{middleware::bearer_token, IdentityVerifier},
    request_id,
};

#[derive(Clone)]
pub struct ChatState {
    pub registry: Arc<ConnectionRegistry>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub settings: SessionSettings,
}

pub fn router(state: ChatState) -> Router {
    Router::new().route("/ws/chat", get(ws_upgrade)).with_state(state)
}

/// The upgrade is never refused for auth reasons: credential problems,
/// including an unparsable query string, are reported on the socket as a
/// policy-violation close.
pub async fn ws_upgrade(
    State(state): State<ChatState>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let credential = query
        .ok()
        .and_then(|Query(mut params)| params.remove("token"))
        .filter(|token| !token.trim().is_empty())
        .or_else(|| bearer_token(&headers).map(ToOwned::to_owned));
    let request_id = session_request_id(&headers);
    let max_frame_bytes = state.settings.max_frame_bytes;

    ws.max_frame_size(max_frame_bytes).max_message_size(max_frame_bytes).on_upgrade(
        move |socket| {
            request_id::scope(
                request_id,
                session::run_session(
                    state.registry,
                    state.verifier,
                    state.settings,
                    credential,
                    socket,
                ),
            )
        },
    )
}

/// The upgraded session runs on its own task, outside the HTTP request scope,
/// so it re-enters the scope under the id the HTTP layer already chose.
fn session_request_id(headers: &HeaderMap) -> String {
    request_id::current().unwrap_or_else(|| request_id::from_headers_or_generate(headers))
}
