use axum::{extract::State, response::IntoResponse, response::Response};
use serde_json::json;
use utoipa::OpenApi;

use crate::builtin::{manual_injector, platform_executor};
use crate::{responses, AppState};

/// Health check.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "Meta",
    operation_id = "healthz_doc",
    description = "Service readiness check with built-in capability availability.",
    responses(
        (status = 200, description = "Service healthy", body = crate::openapi::HealthOk)
    )
)]
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.engine();
    responses::json_ok(json!({
        "ok": true,
        "live_integrations": state.manager().snapshot().len(),
        "platform_executor": platform_executor(&engine).is_ok(),
        "manual_injector": manual_injector(&engine).is_ok(),
    }))
}

/// Service metadata and endpoints index.
#[utoipa::path(
    get,
    path = "/about",
    tag = "Meta",
    operation_id = "about_doc",
    responses(
        (status = 200, description = "Service metadata", body = crate::openapi::AboutResponse)
    )
)]
pub async fn about(State(state): State<AppState>) -> impl IntoResponse {
    let access = state.access();
    responses::json_ok(json!({
        "service": "fleet-server",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": state.endpoints().as_ref(),
        "security": {
            "debug": access.debug(),
            "admin_token": access.admin_configured(),
            "agent_token": access.agent_configured(),
        },
        "secret_key_id": state.cipher().key_id(),
    }))
}

/// Generated OpenAPI document.
#[utoipa::path(
    get,
    path = "/spec/openapi.json",
    tag = "Meta",
    responses((status = 200, description = "OpenAPI document", body = serde_json::Value))
)]
pub async fn openapi() -> Response {
    responses::json_ok(crate::openapi::ApiDoc::openapi())
}
