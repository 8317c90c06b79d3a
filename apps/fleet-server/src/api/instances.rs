use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use fleet_protocol::ManagedInstanceConfig;
use fleet_runtime::{
    CatalogEntry, CurrentStatus, InstanceConfig, InstanceHealth, PersistedInstance,
    RequestedStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::secrets::{SecretCipher, REDACTED};
use crate::store::NewInstance;
use crate::{responses, AppState};

#[derive(Deserialize, ToSchema)]
pub(crate) struct ConfigPair {
    pub key: String,
    pub value: Value,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct CreateInstanceReq {
    pub catalog_entry_id: String,
    /// Remote agent that runs the instance; omit to run it in-process.
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub configuration: Vec<ConfigPair>,
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub requested_status: Option<RequestedStatus>,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct ConfigurationReq {
    pub configuration: Vec<ConfigPair>,
}

#[derive(Deserialize, ToSchema)]
pub(crate) struct RequestedStatusReq {
    #[serde(alias = "requestedStatus")]
    #[schema(value_type = String)]
    pub requested_status: RequestedStatus,
}

#[derive(Serialize)]
struct InstanceView {
    id: String,
    catalog_entry_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog_slug: Option<String>,
    remote_id: Option<String>,
    requested_status: RequestedStatus,
    current_status: CurrentStatus,
    /// A live integration is running for this instance on the platform.
    live: bool,
    health: InstanceHealth,
    configuration: Vec<ManagedInstanceConfig>,
    config_revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

async fn view(state: &AppState, instance: PersistedInstance) -> InstanceView {
    let catalog_slug = state
        .catalog()
        .get(&instance.catalog_entry_id)
        .await
        .map(|entry| entry.slug);
    let live = state.manager().is_live(&instance.id);
    InstanceView {
        live,
        configuration: crate::api::redacted_configuration(&instance),
        id: instance.id,
        catalog_entry_id: instance.catalog_entry_id,
        catalog_slug,
        remote_id: instance.remote_id,
        requested_status: instance.requested_status,
        current_status: instance.current_status,
        health: instance.health,
        config_revision: instance.config_revision,
        created_at: instance.created_at,
        updated_at: instance.updated_at,
    }
}

/// Validate `pairs` against the entry's schema and seal secret values.
///
/// A secret sent back as the redaction marker keeps the sealed value already
/// stored in `existing`.
fn sealed_configuration(
    entry: &CatalogEntry,
    pairs: Vec<ConfigPair>,
    cipher: &SecretCipher,
    existing: Option<&PersistedInstance>,
) -> Result<Vec<InstanceConfig>, Response> {
    let mut supplied = BTreeMap::new();
    for pair in pairs {
        let key = pair.key.trim().to_string();
        if supplied.insert(key.clone(), pair.value).is_some() {
            return Err(responses::bad_request(format!(
                "configuration key `{key}` supplied twice"
            )));
        }
    }
    let resolved = entry
        .resolve_configuration(&supplied)
        .map_err(responses::config_error)?;
    let mut configuration = Vec::with_capacity(resolved.len());
    for (schema, value) in resolved {
        if !schema.is_secret() {
            configuration.push(InstanceConfig {
                key: schema.key,
                value,
                is_encrypted: false,
            });
            continue;
        }
        let kept = existing
            .filter(|_| value.as_str() == Some(REDACTED))
            .and_then(|instance| instance.config_value(&schema.key))
            .filter(|stored| stored.is_encrypted)
            .map(|stored| stored.value.clone());
        let sealed = match kept {
            Some(sealed) => sealed,
            None => cipher.seal_value(&value).map_err(responses::secret_error)?,
        };
        configuration.push(InstanceConfig {
            key: schema.key,
            value: sealed,
            is_encrypted: true,
        });
    }
    Ok(configuration)
}

/// Create a connector instance.
#[utoipa::path(
    post,
    path = "/admin/connector-instances",
    tag = "Instances",
    request_body = CreateInstanceReq,
    responses(
        (status = 201, description = "Created", body = serde_json::Value),
        (status = 400, description = "Invalid configuration"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown catalog entry or remote"),
    )
)]
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateInstanceReq>,
) -> Response {
    if !state.access().admin_ok(&headers) {
        return responses::unauthorized(None);
    }
    let Some(entry) = state.catalog().get(&req.catalog_entry_id).await else {
        return responses::not_found(format!(
            "catalog entry `{}` not found",
            req.catalog_entry_id
        ));
    };
    let remote_id = req.remote_id.filter(|id| !id.trim().is_empty());
    if let Some(remote_id) = remote_id.as_deref() {
        if let Err(err) = state.remotes().require(remote_id).await {
            return responses::remote_error(err);
        }
    }
    let configuration =
        match sealed_configuration(&entry, req.configuration, &state.cipher(), None) {
            Ok(configuration) => configuration,
            Err(resp) => return resp,
        };
    let created = state
        .store()
        .create(NewInstance {
            catalog_entry_id: entry.id,
            remote_id,
            configuration,
            requested_status: req.requested_status.unwrap_or_default(),
        })
        .await;
    match created {
        Ok(instance) => responses::json_status(StatusCode::CREATED, view(&state, instance).await),
        Err(err) => responses::store_error(err),
    }
}

/// List connector instances.
#[utoipa::path(
    get,
    path = "/admin/connector-instances",
    tag = "Instances",
    responses(
        (status = 200, description = "Instances", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
    )
)]
pub async fn list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.access().admin_ok(&headers) {
        return responses::unauthorized(None);
    }
    let mut items = Vec::new();
    for instance in state.store().list().await {
        items.push(view(&state, instance).await);
    }
    responses::json_ok(json!({ "items": items }))
}

/// Read one connector instance. Secret values are redacted.
#[utoipa::path(
    get,
    path = "/admin/connector-instances/{id}",
    tag = "Instances",
    params(("id" = String, Path, description = "Connector instance id")),
    responses(
        (status = 200, description = "Instance", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown instance"),
    )
)]
pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !state.access().admin_ok(&headers) {
        return responses::unauthorized(None);
    }
    match state.store().get(&id).await {
        Some(instance) => responses::json_ok(view(&state, instance).await),
        None => responses::not_found(format!("connector instance `{id}` not found")),
    }
}

/// Replace the configuration. A running integration restarts on the next pass.
#[utoipa::path(
    put,
    path = "/admin/connector-instances/{id}/configuration",
    tag = "Instances",
    params(("id" = String, Path, description = "Connector instance id")),
    request_body = ConfigurationReq,
    responses(
        (status = 200, description = "Configuration replaced", body = serde_json::Value),
        (status = 400, description = "Invalid configuration"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown instance"),
    )
)]
pub async fn update_configuration(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ConfigurationReq>,
) -> Response {
    if !state.access().admin_ok(&headers) {
        return responses::unauthorized(None);
    }
    let Some(existing) = state.store().get(&id).await else {
        return responses::not_found(format!("connector instance `{id}` not found"));
    };
    let Some(entry) = state.catalog().get(&existing.catalog_entry_id).await else {
        return responses::not_found(format!(
            "catalog entry `{}` not found",
            existing.catalog_entry_id
        ));
    };
    let configuration = match sealed_configuration(
        &entry,
        req.configuration,
        &state.cipher(),
        Some(&existing),
    ) {
        Ok(configuration) => configuration,
        Err(resp) => return resp,
    };
    match state.store().replace_configuration(&id, configuration).await {
        Ok(instance) => responses::json_ok(view(&state, instance).await),
        Err(err) => responses::store_error(err),
    }
}

/// Set the desired run state. Returns at once; convergence is asynchronous.
#[utoipa::path(
    put,
    path = "/admin/connector-instances/{id}/requested-status",
    tag = "Instances",
    params(("id" = String, Path, description = "Connector instance id")),
    request_body = RequestedStatusReq,
    responses(
        (status = 200, description = "Requested status stored", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown instance"),
    )
)]
pub async fn set_requested_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<RequestedStatusReq>,
) -> Response {
    if !state.access().admin_ok(&headers) {
        return responses::unauthorized(None);
    }
    match state
        .store()
        .set_requested_status(&id, req.requested_status)
        .await
    {
        Ok(instance) => responses::json_ok(view(&state, instance).await),
        Err(err) => responses::store_error(err),
    }
}

/// Buffered log lines, oldest first.
#[utoipa::path(
    get,
    path = "/admin/connector-instances/{id}/logs",
    tag = "Instances",
    params(("id" = String, Path, description = "Connector instance id")),
    responses(
        (status = 200, description = "Log lines", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown instance"),
    )
)]
pub async fn logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !state.access().admin_ok(&headers) {
        return responses::unauthorized(None);
    }
    match state.store().logs(&id).await {
        Ok(lines) => responses::json_ok(json!({ "id": id, "logs": lines })),
        Err(err) => responses::store_error(err),
    }
}

/// Delete an instance. Its integration is stopped on the next pass.
#[utoipa::path(
    delete,
    path = "/admin/connector-instances/{id}",
    tag = "Instances",
    params(("id" = String, Path, description = "Connector instance id")),
    responses(
        (status = 200, description = "Deleted", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown instance"),
    )
)]
pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !state.access().admin_ok(&headers) {
        return responses::unauthorized(None);
    }
    match state.store().delete(&id).await {
        Ok(removed) => responses::json_ok(json!({ "id": removed.id, "deleted": true })),
        Err(err) => responses::store_error(err),
    }
}

#[cfg(test)]
mod tests {
    use crate::router::{self, paths};
    use crate::secrets::{SecretCipher, REDACTED};
    use crate::test_support::fakes::{FakeFactory, FakeMode};
    use crate::test_support::{api_state, ADMIN_TOKEN};
    use crate::AppState;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use fleet_runtime::{CatalogEntry, CurrentStatus, RequestedStatus};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        let (router, _endpoints) = router::build_router();
        router.with_state(state)
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header("X-Fleet-Admin", ADMIN_TOKEN);
        let body = match body {
            Some(value) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(req.body(body).expect("request"))
            .await
            .expect("response");
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), 1 << 20).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    fn create_body(api_key: &str) -> Value {
        json!({
            "catalog_entry_id": CatalogEntry::id_for_slug("caldera"),
            "configuration": [
                {"key": "URL", "value": "https://caldera.test"},
                {"key": "API_KEY", "value": api_key},
            ],
        })
    }

    #[tokio::test]
    async fn created_secrets_are_sealed_and_redacted() {
        let state = api_state().await;
        let app = app(state.clone());
        let (status, body) = send(
            &app,
            Method::POST,
            paths::ADMIN_INSTANCES,
            Some(create_body("hunter2")),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["requested_status"], "STARTED");
        assert_eq!(body["current_status"], "UNKNOWN");
        assert_eq!(body["catalog_slug"], "caldera");
        assert_eq!(body["configuration"][1]["value"], REDACTED);
        assert!(!body.to_string().contains("hunter2"));

        let id = body["id"].as_str().expect("id");
        let stored = state.store().get(id).await.expect("stored");
        let sealed = stored.config_value("API_KEY").expect("api key");
        assert!(sealed.is_encrypted);
        let sealed = sealed.value.as_str().expect("sealed string");
        assert!(SecretCipher::is_sealed(sealed));
        assert_eq!(state.cipher().open(sealed).expect("open"), "hunter2");
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected() {
        let app = app(api_state().await);
        let missing = json!({
            "catalog_entry_id": CatalogEntry::id_for_slug("caldera"),
            "configuration": [{"key": "URL", "value": "https://caldera.test"}],
        });
        let (status, body) = send(&app, Method::POST, paths::ADMIN_INSTANCES, Some(missing)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap_or_default().contains("API_KEY"));

        let unknown_entry = json!({"catalog_entry_id": "nope", "configuration": []});
        let (status, _) =
            send(&app, Method::POST, paths::ADMIN_INSTANCES, Some(unknown_entry)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let mut bad_remote = create_body("k");
        bad_remote["remote_id"] = json!("ghost");
        let (status, _) = send(&app, Method::POST, paths::ADMIN_INSTANCES, Some(bad_remote)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn configuration_update_bumps_revision_and_keeps_redacted_secret() {
        let state = api_state().await;
        let app = app(state.clone());
        let (_, created) = send(
            &app,
            Method::POST,
            paths::ADMIN_INSTANCES,
            Some(create_body("hunter2")),
        )
        .await;
        let id = created["id"].as_str().expect("id").to_string();
        let before = state.store().get(&id).await.expect("stored");

        let uri = format!("/admin/connector-instances/{id}/configuration");
        let update = json!({"configuration": [
            {"key": "URL", "value": "https://caldera.internal"},
            {"key": "API_KEY", "value": REDACTED},
        ]});
        let (status, body) = send(&app, Method::PUT, &uri, Some(update)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["config_revision"], before.config_revision + 1);
        assert_eq!(body["configuration"][0]["value"], "https://caldera.internal");

        let after = state.store().get(&id).await.expect("stored");
        assert_eq!(after.config_value("API_KEY"), before.config_value("API_KEY"));
    }

    #[tokio::test]
    async fn requested_status_returns_immediately_and_pass_converges() {
        let state = api_state().await;
        let app = app(state.clone());
        let (_, created) = send(
            &app,
            Method::POST,
            paths::ADMIN_INSTANCES,
            Some(create_body("hunter2")),
        )
        .await;
        let id = created["id"].as_str().expect("id").to_string();

        let report = state.manager().monitor_integrations().await.expect("pass");
        assert_eq!(report.started, vec![id.clone()]);
        assert!(state.engine().contains(&id));

        let uri = format!("/admin/connector-instances/{id}/requested-status");
        let (status, body) = send(
            &app,
            Method::PUT,
            &uri,
            Some(json!({"requestedStatus": "STOPPED"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requested_status"], "STOPPED");
        assert_eq!(body["current_status"], "STARTED");
        assert_eq!(body["live"], true);
        assert!(state.engine().contains(&id), "convergence waits for the next pass");

        state.manager().monitor_integrations().await.expect("pass");
        assert!(!state.engine().contains(&id));
        let (_, body) = send(&app, Method::GET, &format!("/admin/connector-instances/{id}"), None).await;
        assert_eq!(body["live"], false);
        let stored = state.store().get(&id).await.expect("stored");
        assert_eq!(stored.requested_status, RequestedStatus::Stopped);
        assert_eq!(stored.current_status, CurrentStatus::Stopped);
    }

    #[tokio::test]
    async fn admin_writes_complete_while_an_integration_is_starting() {
        let state = api_state().await;
        let app = app(state.clone());
        let slow = FakeFactory::new("slow", FakeMode::Persisted);
        state
            .manager()
            .register_factory(slow.clone())
            .await
            .expect("register");
        state.manager().monitor_integrations().await.expect("register catalog");

        let (status, created) = send(
            &app,
            Method::POST,
            paths::ADMIN_INSTANCES,
            Some(json!({"catalog_entry_id": CatalogEntry::id_for_slug("slow")})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().expect("id").to_string();

        slow.switches.set_start_delay(Duration::from_secs(3));
        let pass = {
            let manager = state.manager();
            tokio::spawn(async move { manager.monitor_integrations().await })
        };
        while slow.switches.starts() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let uri = format!("/admin/connector-instances/{id}/requested-status");
        let (status, body) = tokio::time::timeout(
            Duration::from_millis(500),
            send(&app, Method::PUT, &uri, Some(json!({"requested_status": "STOPPED"}))),
        )
        .await
        .expect("admin write does not wait for the start");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requested_status"], "STOPPED");
        assert_eq!(body["live"], false);

        let report = pass.await.expect("join").expect("pass");
        assert_eq!(report.started, vec![id.clone()]);
        let report = state.manager().monitor_integrations().await.expect("pass");
        assert_eq!(report.stopped, vec![id]);
    }

    #[tokio::test]
    async fn delete_removes_instance_and_logs_route_reports_missing() {
        let state = api_state().await;
        let app = app(state.clone());
        let (_, created) = send(
            &app,
            Method::POST,
            paths::ADMIN_INSTANCES,
            Some(create_body("hunter2")),
        )
        .await;
        let id = created["id"].as_str().expect("id").to_string();
        state
            .store()
            .append_logs(&id, vec!["boot".into(), "ready".into()])
            .await
            .expect("logs");

        let logs_uri = format!("/admin/connector-instances/{id}/logs");
        let (status, body) = send(&app, Method::GET, &logs_uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logs"], json!(["boot", "ready"]));

        let uri = format!("/admin/connector-instances/{id}");
        let (status, _) = send(&app, Method::DELETE, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, Method::GET, &logs_uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, Method::GET, paths::ADMIN_INSTANCES, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"], json!([]));
    }

    #[tokio::test]
    async fn admin_routes_require_the_admin_token() {
        let app = app(api_state().await);
        let req = Request::builder()
            .uri(paths::ADMIN_INSTANCES)
            .header(header::AUTHORIZATION, "Bearer wrong")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
