use std::sync::Arc;

use async_trait::async_trait;
use fleet_events::Bus;
use fleet_runtime::{CatalogEntry, ConnectorInstance};

use crate::catalog::CatalogRegistry;
use crate::integration::{Integration, IntegrationError};
use crate::secrets::SecretCipher;
use crate::store::InstanceStore;

/// Shared collaborators handed to every factory during a pass.
#[derive(Clone)]
pub(crate) struct FactoryContext {
    pub catalog: Arc<CatalogRegistry>,
    pub store: Arc<InstanceStore>,
    pub cipher: Arc<SecretCipher>,
    pub bus: Bus,
}

/// One per connector type. Every method except `spawn` is called on every
/// manager pass and must be idempotent.
#[async_trait]
pub(crate) trait IntegrationFactory: Send + Sync {
    /// Stable identity, used in logs, pass reports and to key live integrations.
    fn type_name(&self) -> &str;

    /// Upgrade this factory's own catalog entry. Runs before registration.
    async fn run_migrations(&self, _ctx: &FactoryContext) -> Result<(), IntegrationError> {
        Ok(())
    }

    /// Insert the catalog entry if absent and return the stored one.
    async fn register_catalog_entry(
        &self,
        ctx: &FactoryContext,
    ) -> Result<CatalogEntry, IntegrationError>;

    /// Instances of this type that should be running right now.
    async fn discover_instances(
        &self,
        ctx: &FactoryContext,
        entry: &CatalogEntry,
    ) -> Result<Vec<ConnectorInstance>, IntegrationError>;

    /// Build, but do not start, the runtime object for `instance`.
    fn spawn(
        &self,
        ctx: &FactoryContext,
        entry: &CatalogEntry,
        instance: &ConnectorInstance,
    ) -> Result<Box<dyn Integration>, IntegrationError>;
}

/// Discovery shared by the persisted connector factories: every stored
/// instance of `entry` whose requested status is STARTED.
pub(crate) async fn discover_requested(
    ctx: &FactoryContext,
    entry: &CatalogEntry,
) -> Vec<ConnectorInstance> {
    ctx.store
        .requested_started(&entry.id)
        .await
        .into_iter()
        .map(ConnectorInstance::persisted)
        .collect()
}
