use utoipa::{OpenApi, ToSchema};

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct HealthOk {
    pub ok: bool,
    pub live_integrations: usize,
    pub platform_executor: bool,
    pub manual_injector: bool,
}

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct SecurityPosture {
    pub debug: bool,
    pub admin_token: bool,
    pub agent_token: bool,
}

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct AboutResponse {
    pub service: String,
    pub version: String,
    #[schema(example = json!(["GET /healthz", "POST /remotes/register"]))]
    pub endpoints: Vec<String>,
    pub security: SecurityPosture,
    pub secret_key_id: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::meta::healthz,
        crate::api::meta::about,
        crate::api::meta::openapi,
        crate::api::remote::register,
        crate::api::remote::refresh_connectivity,
        crate::api::remote::managed_instances,
        crate::api::remote::update_status,
        crate::api::remote::push_logs,
        crate::api::remote::health_check,
        crate::api::catalog::list,
        crate::api::catalog::get,
        crate::api::instances::create,
        crate::api::instances::list,
        crate::api::instances::get,
        crate::api::instances::update_configuration,
        crate::api::instances::set_requested_status,
        crate::api::instances::logs,
        crate::api::instances::delete,
        crate::api::integrations::snapshot,
        crate::api::integrations::reconcile,
    ),
    components(schemas(
        HealthOk,
        SecurityPosture,
        AboutResponse,
        crate::api::instances::ConfigPair,
        crate::api::instances::CreateInstanceReq,
        crate::api::instances::ConfigurationReq,
        crate::api::instances::RequestedStatusReq,
    )),
    tags(
        (name = "Meta", description = "Service metadata and health"),
        (name = "Remotes", description = "Agent pairing, status, health and log pushes"),
        (name = "Catalog", description = "Connector templates"),
        (name = "Instances", description = "Connector instance administration"),
        (name = "Integrations", description = "Live integrations and reconcile passes")
    )
)]
pub struct ApiDoc;
