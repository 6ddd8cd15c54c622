//! Forwarder control handlers

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use tracing::info;

use crate::api::server::AppState;
use crate::error::GateError;
use crate::models::{ControlResponse, PinRequest};

fn no_forwarders() -> GateError {
    GateError::NotFound("no forwarders available".to_string())
}

/// Pin a different forwarder at random
pub async fn rotate(State(state): State<AppState>) -> Result<Json<ControlResponse>, GateError> {
    let forwarder = state.controlled.rotate().ok_or_else(no_forwarders)?;

    Ok(Json(ControlResponse::with_current(
        format!("rotated to {}", forwarder.address()),
        &forwarder,
    )))
}

/// Return the pinned forwarder, pinning one if needed
pub async fn current(State(state): State<AppState>) -> Result<Json<ControlResponse>, GateError> {
    let forwarder = state.controlled.current().ok_or_else(no_forwarders)?;

    Ok(Json(ControlResponse::with_current(
        "current forwarder",
        &forwarder,
    )))
}

/// List the whole pool
pub async fn list(State(state): State<AppState>) -> Json<ControlResponse> {
    let forwarders = state.controlled.forwarders();

    Json(ControlResponse::with_list(
        format!("{} forwarders, latency in ms", forwarders.len()),
        forwarders.iter().map(|f| f.as_ref()),
    ))
}

/// Pin the forwarder named in the request body
pub async fn pin(
    State(state): State<AppState>,
    body: Result<Json<PinRequest>, JsonRejection>,
) -> Result<Json<ControlResponse>, GateError> {
    let Json(req) = body.map_err(|e| GateError::InvalidRequest(e.body_text()))?;

    let address = req.address.trim();
    if address.is_empty() {
        return Err(GateError::InvalidRequest("address is required".to_string()));
    }

    let forwarder = state
        .controlled
        .pin(address)
        .ok_or_else(|| GateError::NotFound(format!("forwarder {} is not in the pool", address)))?;

    info!(forwarder = %forwarder.address(), "Forwarder pinned via control API");

    Ok(Json(ControlResponse::with_current(
        format!("pinned {}", forwarder.address()),
        &forwarder,
    )))
}
