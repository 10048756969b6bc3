//! Ingress handlers
//!
//! Bodies are taken as raw bytes so the secret is checked before anything is
//! parsed, and so bad JSON gets the bridge's own error shape.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{info, warn};

use super::{AppState, SECRET_HEADER};
use crate::router::EventOutcome;
use crate::types::MemberId;

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|provided| provided == &*state.secret)
}

fn error(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}

/// POST /events
pub async fn post_event(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !authorized(&state, &headers) {
        warn!("Rejected event with bad or missing secret");
        return error(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return error(StatusCode::BAD_REQUEST, "invalid_json"),
    };

    match state.router.submit(payload).await {
        Ok(EventOutcome::Handled(_)) | Ok(EventOutcome::Ignored { .. }) => {
            Json(json!({ "ok": true })).into_response()
        }
        Ok(EventOutcome::Rejected(e)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": e.to_string() })),
        )
            .into_response(),
        Ok(EventOutcome::Link(response)) => Json(response).into_response(),
        Err(e) => {
            warn!(error = %e, "Event dropped");
            error(StatusCode::SERVICE_UNAVAILABLE, "router_unavailable")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IssueCodeRequest {
    pub chat_id: MemberId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IssueCodeResponse {
    pub code: String,
    pub expires_in_secs: u64,
}

/// POST /links/codes
pub async fn issue_link_code(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !authorized(&state, &headers) {
        return error(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let request: IssueCodeRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return error(StatusCode::BAD_REQUEST, "invalid_json"),
    };

    let code = state.codes.issue(request.chat_id, Instant::now());
    info!(member = %request.chat_id, "Link code requested");

    Json(IssueCodeResponse {
        code,
        expires_in_secs: state.codes.ttl().as_secs(),
    })
    .into_response()
}
