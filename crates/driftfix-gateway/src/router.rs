use axum::Router;
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/nonce", get(api::issue_nonce))
        .route("/api/migrate", post(api::migrate))
        .route("/api/status", get(api::status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
