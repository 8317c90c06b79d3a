use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::Utc;
use fleet_protocol::{
    InstanceHealthCheck, InstanceLogsPush, InstanceStatusUpdate, ManagedInstance,
    ManagedInstanceList, RefreshConnectivityRequest, RegisterRemoteRequest,
};
use fleet_runtime::{InstanceHealth, PersistedInstance};
use serde_json::json;
use tracing::debug;

use crate::remote::Registered;
use crate::{responses, AppState};

/// The instance if it exists and belongs to `remote_id`; 404 otherwise.
async fn owned_instance(
    state: &AppState,
    remote_id: &str,
    instance_id: &str,
) -> Result<PersistedInstance, Response> {
    state
        .remotes()
        .require(remote_id)
        .await
        .map_err(responses::remote_error)?;
    match state.store().get(instance_id).await {
        Some(instance) if instance.remote_id.as_deref() == Some(remote_id) => Ok(instance),
        _ => Err(responses::not_found(format!(
            "connector instance `{instance_id}` not found"
        ))),
    }
}

/// Pair an agent with the platform.
#[utoipa::path(
    post,
    path = "/remotes/register",
    tag = "Remotes",
    request_body = serde_json::Value,
    responses(
        (status = 201, description = "Registration created", body = serde_json::Value),
        (status = 200, description = "Registration updated", body = serde_json::Value),
        (status = 400, description = "Invalid registration"),
        (status = 401, description = "Unauthorized"),
    )
)]
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterRemoteRequest>,
) -> Response {
    if !state.access().agent_ok(&headers) {
        return responses::unauthorized(None);
    }
    match state.remotes().register(req).await {
        Ok((Registered::Created, remote)) => {
            responses::json_status(StatusCode::CREATED, remote.view())
        }
        Ok((Registered::Updated, remote)) => responses::json_ok(remote.view()),
        Err(err) => responses::remote_error(err),
    }
}

/// Record that the agent is alive and which version it runs.
#[utoipa::path(
    put,
    path = "/remotes/{id}/refresh-connectivity",
    tag = "Remotes",
    params(("id" = String, Path, description = "Remote id")),
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Connectivity refreshed", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown remote"),
    )
)]
pub async fn refresh_connectivity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<RefreshConnectivityRequest>>,
) -> Response {
    if !state.access().agent_ok(&headers) {
        return responses::unauthorized(None);
    }
    let version = body.and_then(|Json(req)| req.version);
    match state.remotes().refresh_connectivity(&id, version).await {
        Ok(remote) => responses::json_ok(remote.view()),
        Err(err) => responses::remote_error(err),
    }
}

/// Instances this agent is expected to run, with their desired state.
#[utoipa::path(
    get,
    path = "/remotes/{id}/connector-instances",
    tag = "Remotes",
    params(("id" = String, Path, description = "Remote id")),
    responses(
        (status = 200, description = "Managed instances", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown remote"),
    )
)]
pub async fn managed_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !state.access().agent_ok(&headers) {
        return responses::unauthorized(None);
    }
    if let Err(err) = state.remotes().require(&id).await {
        return responses::remote_error(err);
    }
    let catalog = state.catalog();
    let mut items = Vec::new();
    for instance in state.store().list_for_remote(&id).await {
        let Some(entry) = catalog.get(&instance.catalog_entry_id).await else {
            debug!(
                target: "fleet::remote",
                remote = %id,
                instance = %instance.id,
                "catalog entry not registered yet; instance withheld"
            );
            continue;
        };
        items.push(ManagedInstance {
            configuration: crate::api::redacted_configuration(&instance),
            id: instance.id,
            catalog_entry_id: entry.id,
            catalog_slug: entry.slug,
            container_kind: entry.container_kind,
            requested_status: instance.requested_status,
            current_status: instance.current_status,
        });
    }
    responses::json_ok(ManagedInstanceList { items })
}

/// Store the status the agent observed. Never compared with the requested status.
#[utoipa::path(
    put,
    path = "/remotes/{id}/connector-instances/{instance_id}/status",
    tag = "Remotes",
    params(
        ("id" = String, Path, description = "Remote id"),
        ("instance_id" = String, Path, description = "Connector instance id"),
    ),
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Status stored", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown remote or instance"),
    )
)]
pub async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, instance_id)): Path<(String, String)>,
    Json(req): Json<InstanceStatusUpdate>,
) -> Response {
    if !state.access().agent_ok(&headers) {
        return responses::unauthorized(None);
    }
    if let Err(resp) = owned_instance(&state, &id, &instance_id).await {
        return resp;
    }
    match state
        .store()
        .set_current_status(&instance_id, req.current_status)
        .await
    {
        Ok(instance) => responses::json_ok(json!({
            "id": instance.id,
            "current_status": instance.current_status,
            "requested_status": instance.requested_status,
        })),
        Err(err) => responses::store_error(err),
    }
}

/// Append log lines to the instance's bounded buffer.
#[utoipa::path(
    post,
    path = "/remotes/{id}/connector-instances/{instance_id}/logs",
    tag = "Remotes",
    params(
        ("id" = String, Path, description = "Remote id"),
        ("instance_id" = String, Path, description = "Connector instance id"),
    ),
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Lines appended", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown remote or instance"),
    )
)]
pub async fn push_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, instance_id)): Path<(String, String)>,
    Json(req): Json<InstanceLogsPush>,
) -> Response {
    if !state.access().agent_ok(&headers) {
        return responses::unauthorized(None);
    }
    if let Err(resp) = owned_instance(&state, &id, &instance_id).await {
        return resp;
    }
    let received = req.logs.len();
    match state.store().append_logs(&instance_id, req.logs).await {
        Ok(added) => responses::json_ok(json!({
            "id": instance_id,
            "received": received,
            "added": added,
        })),
        Err(err) => responses::store_error(err),
    }
}

/// Store the agent's health report as sent, reboot-loop flag included.
#[utoipa::path(
    put,
    path = "/remotes/{id}/connector-instances/{instance_id}/health-check",
    tag = "Remotes",
    params(
        ("id" = String, Path, description = "Remote id"),
        ("instance_id" = String, Path, description = "Connector instance id"),
    ),
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Health stored", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown remote or instance"),
    )
)]
pub async fn health_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, instance_id)): Path<(String, String)>,
    Json(req): Json<InstanceHealthCheck>,
) -> Response {
    if !state.access().agent_ok(&headers) {
        return responses::unauthorized(None);
    }
    if let Err(resp) = owned_instance(&state, &id, &instance_id).await {
        return resp;
    }
    let health = InstanceHealth {
        restart_count: req.restart_count,
        started_at: req.started_at,
        is_in_reboot_loop: req.is_in_reboot_loop,
        reported_at: Some(Utc::now()),
    };
    match state.store().record_health(&instance_id, health).await {
        Ok(instance) => responses::json_ok(json!({
            "id": instance.id,
            "health": instance.health,
        })),
        Err(err) => responses::store_error(err),
    }
}
