//! API route definitions

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;
use crate::error::GateError;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/control/forwarder", control_routes())
        .with_state(state)
}

/// Forwarder control routes, answering other methods with the JSON envelope
fn control_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/rotate",
            post(handlers::control::rotate).fallback(|| async { GateError::MethodNotAllowed("POST") }),
        )
        .route(
            "/current",
            get(handlers::control::current).fallback(|| async { GateError::MethodNotAllowed("GET") }),
        )
        .route(
            "/list",
            get(handlers::control::list).fallback(|| async { GateError::MethodNotAllowed("GET") }),
        )
        .route(
            "/pin",
            post(handlers::control::pin).fallback(|| async { GateError::MethodNotAllowed("POST") }),
        )
}
