//! HTTP ingress for game-server webhooks
//!
//! Provides:
//! - `GET /health`
//! - `POST /events` for game events, authenticated by `x-bridge-secret`
//! - `POST /links/codes` to issue a one-time link code for a chat member

pub mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::link::LinkCodes;
use crate::router::RouterHandle;

pub const SECRET_HEADER: &str = "x-bridge-secret";

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub secret: Arc<str>,
    pub router: RouterHandle,
    pub codes: Arc<LinkCodes>,
}

impl AppState {
    pub fn new(secret: impl Into<Arc<str>>, router: RouterHandle, codes: Arc<LinkCodes>) -> Self {
        Self {
            secret: secret.into(),
            router,
            codes,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/events", post(routes::post_event))
        .route("/links/codes", post(routes::issue_link_code))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
