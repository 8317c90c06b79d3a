use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_runtime::{
    CatalogEntry, ConnectorInstance, ContainerKind, CurrentStatus, InstanceConfig,
    PersistedInstance,
};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::components::{ComponentError, ComponentRequestEngine, ComponentSet};
use crate::config::ConnectorTemplate;
use crate::factory::{self, FactoryContext, IntegrationFactory};
use crate::integration::{Integration, IntegrationError};
use crate::secrets::{SecretCipher, SecretError};
use crate::store::{InstanceStore, StoreError};

/// Capability a running connector instance publishes under its catalog slug
/// and its instance id.
pub(crate) struct ConnectorHandle {
    instance_id: String,
    kind: ContainerKind,
    remote_id: Option<String>,
    settings: RwLock<Settings>,
    cipher: Arc<SecretCipher>,
}

struct Settings {
    revision: u64,
    values: BTreeMap<String, InstanceConfig>,
}

impl ConnectorHandle {
    fn new(instance: &PersistedInstance, entry: &CatalogEntry, cipher: Arc<SecretCipher>) -> Self {
        Self {
            instance_id: instance.id.clone(),
            kind: entry.container_kind,
            remote_id: instance.remote_id.clone(),
            settings: RwLock::new(Settings::from_instance(instance)),
            cipher,
        }
    }

    #[allow(dead_code)]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[allow(dead_code)]
    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    #[allow(dead_code)]
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    #[allow(dead_code)]
    pub fn revision(&self) -> u64 {
        self.settings.read().revision
    }

    /// Plain configuration value. Secrets are not returned here; use [`Self::secret`].
    #[allow(dead_code)]
    pub fn setting(&self, key: &str) -> Option<Value> {
        self.settings
            .read()
            .values
            .get(key)
            .filter(|config| !config.is_encrypted)
            .map(|config| config.value.clone())
    }

    #[allow(dead_code)]
    pub fn secret(&self, key: &str) -> Result<Option<String>, SecretError> {
        let sealed = self
            .settings
            .read()
            .values
            .get(key)
            .filter(|config| config.is_encrypted)
            .and_then(|config| config.value.as_str().map(str::to_string));
        sealed.map(|sealed| self.cipher.open(&sealed)).transpose()
    }

    fn replace(&self, instance: &PersistedInstance) {
        *self.settings.write() = Settings::from_instance(instance);
    }
}

impl Settings {
    fn from_instance(instance: &PersistedInstance) -> Self {
        Self {
            revision: instance.config_revision,
            values: instance
                .configuration
                .iter()
                .map(|config| (config.key.clone(), config.clone()))
                .collect(),
        }
    }
}

#[allow(dead_code)]
pub(crate) fn connector_handle(
    engine: &ComponentRequestEngine,
    identifier: &str,
) -> Result<Arc<ConnectorHandle>, ComponentError> {
    engine.request_as::<ConnectorHandle>(identifier)
}

/// One factory per `[[connectors]]` template.
pub(crate) struct ConnectorFactory {
    type_name: String,
    template: ConnectorTemplate,
}

impl ConnectorFactory {
    pub fn new(template: ConnectorTemplate) -> Self {
        Self {
            type_name: format!("connector:{}", template.slug),
            template,
        }
    }
}

#[async_trait]
impl IntegrationFactory for ConnectorFactory {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    async fn run_migrations(&self, ctx: &FactoryContext) -> Result<(), IntegrationError> {
        let target = self.template.schema_version;
        ctx.catalog
            .migrate(&self.template.slug, |entry| {
                if entry.schema_version >= target {
                    return false;
                }
                self.template.apply_to(entry);
                true
            })
            .await?;
        Ok(())
    }

    async fn register_catalog_entry(
        &self,
        ctx: &FactoryContext,
    ) -> Result<CatalogEntry, IntegrationError> {
        let (_, stored) = ctx
            .catalog
            .insert_if_absent(self.template.to_catalog_entry())
            .await?;
        Ok(stored)
    }

    async fn discover_instances(
        &self,
        ctx: &FactoryContext,
        entry: &CatalogEntry,
    ) -> Result<Vec<ConnectorInstance>, IntegrationError> {
        Ok(factory::discover_requested(ctx, entry).await)
    }

    fn spawn(
        &self,
        ctx: &FactoryContext,
        entry: &CatalogEntry,
        instance: &ConnectorInstance,
    ) -> Result<Box<dyn Integration>, IntegrationError> {
        let persisted = instance.as_persisted().ok_or_else(|| {
            IntegrationError::InvalidConfig(format!(
                "{} only runs persisted instances",
                self.type_name
            ))
        })?;
        Ok(Box::new(ConnectorIntegration {
            instance: persisted.clone(),
            entry: entry.clone(),
            store: ctx.store.clone(),
            cipher: ctx.cipher.clone(),
            handle: None,
        }))
    }
}

struct ConnectorIntegration {
    instance: PersistedInstance,
    entry: CatalogEntry,
    store: Arc<InstanceStore>,
    cipher: Arc<SecretCipher>,
    handle: Option<Arc<ConnectorHandle>>,
}

impl ConnectorIntegration {
    /// Only instances without an owning agent report their own status.
    fn in_process(&self) -> bool {
        !self.instance.is_remote()
    }

    async fn report(&self, status: CurrentStatus) -> Result<(), StoreError> {
        if !self.in_process() {
            return Ok(());
        }
        self.store
            .set_current_status(&self.instance.id, status)
            .await
            .map(|_| ())
    }

    fn check_configuration(&self) -> Result<(), IntegrationError> {
        for schema in &self.entry.config_schema {
            let Some(config) = self.instance.config_value(&schema.key) else {
                if schema.required {
                    return Err(IntegrationError::InvalidConfig(format!(
                        "required key `{}` is not set",
                        schema.key
                    )));
                }
                continue;
            };
            if config.value.is_null() && schema.required {
                return Err(IntegrationError::InvalidConfig(format!(
                    "required key `{}` is empty",
                    schema.key
                )));
            }
            if schema.is_secret() {
                let sealed = config.value.as_str().unwrap_or_default();
                self.cipher.open(sealed).map_err(|err| {
                    IntegrationError::InvalidConfig(format!(
                        "secret `{}` cannot be opened: {err}",
                        schema.key
                    ))
                })?;
            } else if !config.value.is_null() {
                schema
                    .validate(&config.value)
                    .map_err(|err| IntegrationError::InvalidConfig(err.to_string()))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Integration for ConnectorIntegration {
    fn instance_id(&self) -> &str {
        &self.instance.id
    }

    async fn start(&mut self, components: &mut ComponentSet) -> Result<(), IntegrationError> {
        self.report(CurrentStatus::Starting).await?;
        if let Err(err) = self.check_configuration() {
            if let Err(store_err) = self.report(CurrentStatus::Error).await {
                warn!(
                    target: "fleet::integration",
                    instance = %self.instance.id,
                    error = %store_err,
                    "could not record start failure"
                );
            }
            return Err(err);
        }
        let handle = Arc::new(ConnectorHandle::new(
            &self.instance,
            &self.entry,
            self.cipher.clone(),
        ));
        components.insert_all(
            [self.entry.slug.as_str(), self.instance.id.as_str()],
            handle.clone(),
        );
        self.handle = Some(handle);
        self.report(CurrentStatus::Started).await?;
        info!(
            target: "fleet::integration",
            instance = %self.instance.id,
            slug = %self.entry.slug,
            remote = self.instance.remote_id.as_deref().unwrap_or("-"),
            "connector integration started"
        );
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), IntegrationError> {
        let latest = self
            .store
            .get(&self.instance.id)
            .await
            .ok_or_else(|| IntegrationError::Refresh("instance no longer exists".into()))?;
        if let Some(handle) = &self.handle {
            handle.replace(&latest);
        }
        let drifted = self.in_process() && latest.current_status != CurrentStatus::Started;
        self.instance = latest;
        if drifted {
            debug!(
                target: "fleet::integration",
                instance = %self.instance.id,
                "re-reporting started status"
            );
            self.report(CurrentStatus::Started).await?;
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), IntegrationError> {
        self.handle = None;
        match self.report(CurrentStatus::Stopped).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewInstance;
    use crate::test_support::{manager_with_factories, sample_template};
    use fleet_runtime::RequestedStatus;
    use serde_json::json;

    async fn create(
        ctx: &FactoryContext,
        remote_id: Option<&str>,
        configuration: Vec<InstanceConfig>,
    ) -> PersistedInstance {
        let entry = ctx.catalog.by_slug("caldera").await.expect("catalog entry");
        ctx.store
            .create(NewInstance {
                catalog_entry_id: entry.id,
                remote_id: remote_id.map(str::to_string),
                configuration,
                requested_status: RequestedStatus::Started,
            })
            .await
            .expect("create instance")
    }

    fn valid_config(cipher: &SecretCipher) -> Vec<InstanceConfig> {
        vec![
            InstanceConfig {
                key: "URL".into(),
                value: json!("https://caldera.test"),
                is_encrypted: false,
            },
            InstanceConfig {
                key: "API_KEY".into(),
                value: cipher.seal_value(&json!("s3cret")).expect("seal"),
                is_encrypted: true,
            },
        ]
    }

    async fn setup() -> (Arc<crate::manager::IntegrationManager>, FactoryContext) {
        let factories: Vec<Arc<dyn IntegrationFactory>> =
            vec![Arc::new(ConnectorFactory::new(sample_template()))];
        let (manager, ctx) = manager_with_factories(factories).await;
        manager.monitor_integrations().await.expect("register catalog");
        (manager, ctx)
    }

    #[tokio::test]
    async fn in_process_instance_reports_its_own_status() {
        let (manager, ctx) = setup().await;
        let instance = create(&ctx, None, valid_config(&ctx.cipher)).await;

        let report = manager.monitor_integrations().await.expect("pass");
        assert_eq!(report.started, vec![instance.id.clone()]);
        let stored = ctx.store.get(&instance.id).await.expect("instance");
        assert_eq!(stored.current_status, CurrentStatus::Started);

        let handle = connector_handle(&manager.engine(), "caldera").expect("by slug");
        assert_eq!(handle.instance_id(), instance.id);
        assert_eq!(handle.kind(), ContainerKind::Executor);
        assert_eq!(handle.setting("URL"), Some(json!("https://caldera.test")));
        assert_eq!(handle.setting("API_KEY"), None);
        assert_eq!(handle.secret("API_KEY").expect("open").as_deref(), Some("s3cret"));

        ctx.store
            .set_requested_status(&instance.id, RequestedStatus::Stopped)
            .await
            .expect("requested");
        manager.monitor_integrations().await.expect("stop pass");
        let stored = ctx.store.get(&instance.id).await.expect("instance");
        assert_eq!(stored.current_status, CurrentStatus::Stopped);
        assert!(connector_handle(&manager.engine(), &instance.id).is_err());
    }

    #[tokio::test]
    async fn remote_instances_leave_current_status_to_the_agent() {
        let (manager, ctx) = setup().await;
        let instance = create(&ctx, Some("remote-1"), valid_config(&ctx.cipher)).await;

        manager.monitor_integrations().await.expect("pass");
        let handle = connector_handle(&manager.engine(), &instance.id).expect("live");
        assert_eq!(handle.remote_id(), Some("remote-1"));
        let stored = ctx.store.get(&instance.id).await.expect("instance");
        assert_eq!(stored.current_status, CurrentStatus::Unknown);
    }

    #[tokio::test]
    async fn missing_required_key_fails_start_and_marks_error() {
        let (manager, ctx) = setup().await;
        let mut config = valid_config(&ctx.cipher);
        config.retain(|c| c.key != "URL");
        let instance = create(&ctx, None, config).await;

        let report = manager.monitor_integrations().await.expect("pass");
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("URL"));
        assert!(connector_handle(&manager.engine(), "caldera").is_err());
        let stored = ctx.store.get(&instance.id).await.expect("instance");
        assert_eq!(stored.current_status, CurrentStatus::Error);
    }

    #[tokio::test]
    async fn secrets_sealed_with_another_key_fail_start() {
        let (manager, ctx) = setup().await;
        let foreign = SecretCipher::ephemeral();
        create(&ctx, None, valid_config(&foreign)).await;

        let report = manager.monitor_integrations().await.expect("pass");
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("API_KEY"));
    }

    #[tokio::test]
    async fn refresh_pulls_configuration_from_the_store() {
        let (manager, ctx) = setup().await;
        let instance = create(&ctx, Some("remote-1"), valid_config(&ctx.cipher)).await;
        manager.monitor_integrations().await.expect("pass");

        let handle = connector_handle(&manager.engine(), &instance.id).expect("live");
        let mut config = valid_config(&ctx.cipher);
        config[0].value = json!("https://other.test");
        ctx.store
            .replace_configuration(&instance.id, config)
            .await
            .expect("configure");

        assert_eq!(manager.refresh_integrations().await, 1);
        assert_eq!(handle.setting("URL"), Some(json!("https://other.test")));
        assert_eq!(handle.revision(), instance.config_revision + 1);
    }

    #[tokio::test]
    async fn newer_template_migrates_the_catalog_entry() {
        let (manager, ctx) = setup().await;
        let before = ctx.catalog.by_slug("caldera").await.expect("entry");

        let mut template = sample_template();
        template.schema_version = before.schema_version + 1;
        template.title = "Caldera v2".into();
        let factory = ConnectorFactory::new(template);
        factory.run_migrations(&ctx).await.expect("migrate");
        factory.run_migrations(&ctx).await.expect("idempotent");

        let after = ctx.catalog.by_slug("caldera").await.expect("entry");
        assert_eq!(after.id, before.id);
        assert_eq!(after.title, "Caldera v2");
        assert_eq!(after.schema_version, before.schema_version + 1);
        assert_eq!(ctx.catalog.list().await.len(), 1);
        drop(manager);
    }
}
