use std::mem;

use axum::{
    handler::Handler,
    routing::{delete, get, post, put},
    Router,
};

use crate::{api, AppState};

/// Router plus an index of `METHOD path` strings for `/about`.
pub(crate) struct RouterBuilder {
    router: Router<AppState>,
    endpoints: Vec<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: Vec::new(),
        }
    }

    fn record(&mut self, method: &str, path: &'static str) {
        self.endpoints.push(format!("{} {}", method, path));
    }

    pub fn route_get<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: 'static,
    {
        self.record("GET", path);
        let router = mem::take(&mut self.router);
        self.router = router.route(path, get(handler));
        self
    }

    pub fn route_post<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: 'static,
    {
        self.record("POST", path);
        let router = mem::take(&mut self.router);
        self.router = router.route(path, post(handler));
        self
    }

    pub fn route_put<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: 'static,
    {
        self.record("PUT", path);
        let router = mem::take(&mut self.router);
        self.router = router.route(path, put(handler));
        self
    }

    pub fn route_delete<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: 'static,
    {
        self.record("DELETE", path);
        let router = mem::take(&mut self.router);
        self.router = router.route(path, delete(handler));
        self
    }

    pub fn build(self) -> (Router<AppState>, Vec<String>) {
        (self.router, self.endpoints)
    }
}

pub(crate) mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const ABOUT: &str = "/about";
    pub const SPEC_OPENAPI: &str = "/spec/openapi.json";

    pub const REMOTES_REGISTER: &str = "/remotes/register";
    pub const REMOTES_REFRESH_CONNECTIVITY: &str = "/remotes/{id}/refresh-connectivity";
    pub const REMOTES_INSTANCES: &str = "/remotes/{id}/connector-instances";
    pub const REMOTES_INSTANCE_STATUS: &str =
        "/remotes/{id}/connector-instances/{instance_id}/status";
    pub const REMOTES_INSTANCE_LOGS: &str = "/remotes/{id}/connector-instances/{instance_id}/logs";
    pub const REMOTES_INSTANCE_HEALTH: &str =
        "/remotes/{id}/connector-instances/{instance_id}/health-check";

    pub const ADMIN_CATALOG: &str = "/admin/catalog";
    pub const ADMIN_CATALOG_ID: &str = "/admin/catalog/{id}";
    pub const ADMIN_INSTANCES: &str = "/admin/connector-instances";
    pub const ADMIN_INSTANCE_ID: &str = "/admin/connector-instances/{id}";
    pub const ADMIN_INSTANCE_CONFIGURATION: &str = "/admin/connector-instances/{id}/configuration";
    pub const ADMIN_INSTANCE_REQUESTED_STATUS: &str =
        "/admin/connector-instances/{id}/requested-status";
    pub const ADMIN_INSTANCE_LOGS: &str = "/admin/connector-instances/{id}/logs";
    pub const ADMIN_INTEGRATIONS: &str = "/admin/integrations";
    pub const ADMIN_INTEGRATIONS_RECONCILE: &str = "/admin/integrations/reconcile";
}

pub(crate) fn build_router() -> (Router<AppState>, Vec<String>) {
    let mut builder = RouterBuilder::new();
    builder
        .route_get(paths::HEALTHZ, api::meta::healthz)
        .route_get(paths::ABOUT, api::meta::about)
        .route_get(paths::SPEC_OPENAPI, api::meta::openapi);
    register_remote_routes(&mut builder);
    register_admin_routes(&mut builder);
    builder.build()
}

fn register_remote_routes(builder: &mut RouterBuilder) {
    builder
        .route_post(paths::REMOTES_REGISTER, api::remote::register)
        .route_put(
            paths::REMOTES_REFRESH_CONNECTIVITY,
            api::remote::refresh_connectivity,
        )
        .route_get(paths::REMOTES_INSTANCES, api::remote::managed_instances)
        .route_put(paths::REMOTES_INSTANCE_STATUS, api::remote::update_status)
        .route_post(paths::REMOTES_INSTANCE_LOGS, api::remote::push_logs)
        .route_put(paths::REMOTES_INSTANCE_HEALTH, api::remote::health_check);
}

fn register_admin_routes(builder: &mut RouterBuilder) {
    builder
        .route_get(paths::ADMIN_CATALOG, api::catalog::list)
        .route_get(paths::ADMIN_CATALOG_ID, api::catalog::get)
        .route_post(paths::ADMIN_INSTANCES, api::instances::create)
        .route_get(paths::ADMIN_INSTANCES, api::instances::list)
        .route_get(paths::ADMIN_INSTANCE_ID, api::instances::get)
        .route_delete(paths::ADMIN_INSTANCE_ID, api::instances::delete)
        .route_put(
            paths::ADMIN_INSTANCE_CONFIGURATION,
            api::instances::update_configuration,
        )
        .route_put(
            paths::ADMIN_INSTANCE_REQUESTED_STATUS,
            api::instances::set_requested_status,
        )
        .route_get(paths::ADMIN_INSTANCE_LOGS, api::instances::logs)
        .route_get(paths::ADMIN_INTEGRATIONS, api::integrations::snapshot)
        .route_post(
            paths::ADMIN_INTEGRATIONS_RECONCILE,
            api::integrations::reconcile,
        );
}
