use axum::{extract::State, http::HeaderMap, response::Response};
use serde_json::json;

use crate::{responses, AppState};

/// Integrations currently live in this process.
#[utoipa::path(
    get,
    path = "/admin/integrations",
    tag = "Integrations",
    responses(
        (status = 200, description = "Live integrations and registered factories", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
    )
)]
pub async fn snapshot(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.access().admin_ok(&headers) {
        return responses::unauthorized(None);
    }
    let manager = state.manager();
    responses::json_ok(json!({
        "factories": manager.factory_names().await,
        "items": manager.snapshot(),
        "identifiers": state.engine().identifiers(),
    }))
}

/// Run a reconcile pass now instead of waiting for the timer.
#[utoipa::path(
    post,
    path = "/admin/integrations/reconcile",
    tag = "Integrations",
    responses(
        (status = 200, description = "Pass report", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
    )
)]
pub async fn reconcile(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.access().admin_ok(&headers) {
        return responses::unauthorized(None);
    }
    match state.manager().monitor_integrations().await {
        Ok(report) => responses::json_ok(report),
        Err(err) => responses::internal(err.to_string()),
    }
}
