use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_events::Bus;
use fleet_topics::TOPIC_SERVICE_START;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    app_state::AppState,
    builtin::BuiltinFactory,
    catalog::CatalogRegistry,
    config::ServerConfig,
    connector::ConnectorFactory,
    factory::IntegrationFactory,
    remote::RemoteRegistry,
    router,
    secrets::SecretCipher,
    security::AccessPolicy,
    store::InstanceStore,
    tasks::TaskManager,
};

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<AppState>,
    pub state: AppState,
    pub background_tasks: TaskManager,
}

/// Open persisted state, register every factory, run the first pass and
/// start the background loops.
pub(crate) async fn build(config: &ServerConfig) -> Result<BootstrapOutput> {
    let bus = Bus::new(256);
    let access = AccessPolicy::from_config(&config.security);
    if access.debug() {
        warn!("debug mode: admin and agent surfaces are open without tokens");
    } else {
        if !access.admin_configured() {
            warn!("no admin token configured; admin surface is closed");
        }
        if !access.agent_configured() {
            warn!("no agent token configured; agent surface is closed");
        }
    }

    let cipher = SecretCipher::from_settings(config.secrets.key.as_deref(), &config.secrets.key_id)
        .context("load secret key")?;
    info!(target: "fleet::secrets", key_id = cipher.key_id(), "secret cipher ready");

    let log_capacity = config.store.log_capacity;
    let (catalog, store, remotes) = match config.store.state_dir.clone() {
        Some(dir) => {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create state dir {}", dir.display()))?;
            let catalog = CatalogRegistry::open(bus.clone(), dir.clone())
                .await
                .context("open catalog")?;
            let store = InstanceStore::open(bus.clone(), log_capacity, dir.clone())
                .await
                .context("open instance store")?;
            let remotes = RemoteRegistry::open(bus.clone(), dir)
                .await
                .context("open remote registry")?;
            (catalog, store, remotes)
        }
        None => {
            warn!("no state_dir configured; catalog, instances and remotes live in memory only");
            (
                CatalogRegistry::in_memory(bus.clone()),
                InstanceStore::in_memory(bus.clone(), log_capacity),
                RemoteRegistry::in_memory(bus.clone()),
            )
        }
    };

    let (router, endpoints) = router::build_router();
    let state = AppState::builder(bus.clone(), access)
        .with_catalog(Arc::new(catalog))
        .with_store(Arc::new(store))
        .with_remotes(Arc::new(remotes))
        .with_cipher(Arc::new(cipher))
        .with_manager_options(config.manager.options())
        .with_endpoints(Arc::new(endpoints))
        .build();

    let manager = state.manager();
    let mut factories: Vec<Arc<dyn IntegrationFactory>> = vec![
        Arc::new(BuiltinFactory::platform_executor()),
        Arc::new(BuiltinFactory::manual_injector()),
    ];
    for template in &config.connectors {
        factories.push(Arc::new(ConnectorFactory::new(template.clone())));
    }
    for factory in factories {
        manager
            .register_factory(factory)
            .await
            .context("register integration factory")?;
    }

    match manager.monitor_integrations().await {
        Ok(report) => info!(
            target: "fleet::manager",
            started = report.started.len(),
            failures = report.failures.len(),
            "initial integrations pass complete"
        ),
        Err(err) => warn!(target: "fleet::manager", error = %err, "initial integrations pass failed"),
    }

    let mut background_tasks = TaskManager::new();
    let cancel = background_tasks.cancellation();
    background_tasks.push(
        manager.spawn_monitor_loop(config.manager.monitor_interval(), cancel.clone()),
    );
    background_tasks.push(manager.spawn_refresh_loop(config.manager.refresh_interval(), cancel));

    bus.publish(
        TOPIC_SERVICE_START,
        &json!({
            "bind": config.server.bind,
            "factories": manager.factory_names().await,
            "tasks": background_tasks.names(),
        }),
    );

    Ok(BootstrapOutput {
        router,
        state,
        background_tasks,
    })
}

pub(crate) fn attach_http_layers(router: axum::Router<()>) -> axum::Router<()> {
    use tower_http::trace::TraceLayer;

    router.layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::test_support::sample_template;
    use tempfile::tempdir;

    #[tokio::test]
    async fn boot_registers_builtins_and_templates() {
        let dir = tempdir().expect("tempdir");
        let mut config = ServerConfig::default();
        config.store.state_dir = Some(dir.path().join("state"));
        config.connectors.push(sample_template());

        let output = build(&config).await.expect("bootstrap");
        let manager = output.state.manager();
        assert_eq!(
            manager.factory_names().await,
            vec![
                "platform-executor".to_string(),
                "manual-injector".to_string(),
                "connector:caldera".to_string(),
            ]
        );
        assert!(crate::builtin::platform_executor(&output.state.engine()).is_ok());
        assert!(output.state.catalog().by_slug("caldera").await.is_some());
        assert_eq!(output.background_tasks.len(), 2);

        output
            .background_tasks
            .shutdown_with_grace(std::time::Duration::ZERO)
            .await;
        manager.shutdown().await.expect("shutdown");
        assert!(crate::builtin::platform_executor(&output.state.engine()).is_err());
    }

    #[tokio::test]
    async fn template_version_bump_migrates_the_persisted_entry() {
        let dir = tempdir().expect("tempdir");
        let mut config = ServerConfig::default();
        config.store.state_dir = Some(dir.path().join("state"));
        config.connectors.push(sample_template());

        let first = build(&config).await.expect("first boot");
        let original = first
            .state
            .catalog()
            .by_slug("caldera")
            .await
            .expect("entry");
        first
            .background_tasks
            .shutdown_with_grace(std::time::Duration::ZERO)
            .await;
        first.state.manager().shutdown().await.expect("shutdown");

        config.connectors[0].schema_version = original.schema_version + 1;
        config.connectors[0].title = "Caldera 5".into();
        let second = build(&config).await.expect("second boot");
        let migrated = second
            .state
            .catalog()
            .by_slug("caldera")
            .await
            .expect("entry");
        assert_eq!(migrated.id, original.id);
        assert_eq!(migrated.created_at, original.created_at);
        assert_eq!(migrated.schema_version, original.schema_version + 1);
        assert_eq!(migrated.title, "Caldera 5");
        assert!(migrated.updated_at > original.updated_at);
        second
            .background_tasks
            .shutdown_with_grace(std::time::Duration::ZERO)
            .await;
    }

    #[tokio::test]
    async fn malformed_secret_key_fails_boot() {
        let mut config = ServerConfig::default();
        config.secrets.key = Some("not base64!".into());
        assert!(build(&config).await.is_err());
    }
}
