use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
};
use serde_json::json;

use crate::{responses, AppState};

/// Registered connector templates.
#[utoipa::path(
    get,
    path = "/admin/catalog",
    tag = "Catalog",
    responses(
        (status = 200, description = "Catalog entries", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
    )
)]
pub async fn list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.access().admin_ok(&headers) {
        return responses::unauthorized(None);
    }
    responses::json_ok(json!({ "items": state.catalog().list().await }))
}

#[utoipa::path(
    get,
    path = "/admin/catalog/{id}",
    tag = "Catalog",
    params(("id" = String, Path, description = "Catalog entry id or slug")),
    responses(
        (status = 200, description = "Catalog entry", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown catalog entry"),
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
    let catalog = state.catalog();
    let entry = match catalog.get(&id).await {
        Some(entry) => Some(entry),
        None => catalog.by_slug(&id).await,
    };
    match entry {
        Some(entry) => responses::json_ok(entry),
        None => responses::not_found(format!("catalog entry `{id}` not found")),
    }
}

#[cfg(test)]
mod tests {
    use crate::router::{self, paths};
    use crate::test_support::{api_state, ADMIN_TOKEN};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use fleet_runtime::CatalogEntry;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get(app: &Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::builder().uri(uri);
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let resp = app
            .clone()
            .oneshot(req.body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), 1 << 20).await.expect("body");
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn entries_resolve_by_id_or_slug() {
        let (router, _) = router::build_router();
        let app = router.with_state(api_state().await);

        let (status, body) = get(&app, paths::ADMIN_CATALOG, Some(ADMIN_TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().expect("items");
        assert!(items.iter().any(|entry| entry["slug"] == "caldera"));

        let id = CatalogEntry::id_for_slug("caldera");
        let (status, by_id) = get(&app, &format!("/admin/catalog/{id}"), Some(ADMIN_TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        let (_, by_slug) = get(&app, "/admin/catalog/caldera", Some(ADMIN_TOKEN)).await;
        assert_eq!(by_id["id"], by_slug["id"]);

        let (status, _) = get(&app, "/admin/catalog/nope", Some(ADMIN_TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(&app, paths::ADMIN_CATALOG, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
