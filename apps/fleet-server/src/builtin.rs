//! Built-in capabilities that need no external process: they are discovered
//! as in-memory autostart instances on every pass.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_runtime::{CatalogEntry, ConnectorInstance, ContainerKind};
use tracing::debug;

use crate::components::{ComponentError, ComponentRequestEngine, ComponentSet};
use crate::factory::{FactoryContext, IntegrationFactory};
use crate::integration::{Integration, IntegrationError};

pub(crate) const PLATFORM_EXECUTOR: &str = "platform-executor";
pub(crate) const MANUAL_INJECTOR: &str = "manual-injector";
pub(crate) const BUILTIN_SLUGS: &[&str] = &[PLATFORM_EXECUTOR, MANUAL_INJECTOR];

/// Runs commands on the platform's own agents.
#[derive(Debug)]
pub(crate) struct PlatformExecutor {
    instance_id: String,
    dispatched: AtomicU64,
}

impl PlatformExecutor {
    fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            dispatched: AtomicU64::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Queue a command for `target`; returns its sequence number.
    #[allow(dead_code)]
    pub fn dispatch(&self, target: &str) -> u64 {
        let seq = self.dispatched.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(target: "fleet::integration", executor = %self.instance_id, target, seq, "command dispatched");
        seq
    }

    #[allow(dead_code)]
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }
}

/// Injects that an operator performs by hand; the platform only tracks them.
#[derive(Debug)]
pub(crate) struct ManualInjector {
    instance_id: String,
    recorded: AtomicU64,
}

impl ManualInjector {
    fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            recorded: AtomicU64::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[allow(dead_code)]
    pub fn record(&self, inject_id: &str) -> u64 {
        let seq = self.recorded.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(target: "fleet::integration", injector = %self.instance_id, inject = inject_id, seq, "manual inject recorded");
        seq
    }
}

pub(crate) fn platform_executor(
    engine: &ComponentRequestEngine,
) -> Result<Arc<PlatformExecutor>, ComponentError> {
    engine.request_as::<PlatformExecutor>(PLATFORM_EXECUTOR)
}

pub(crate) fn manual_injector(
    engine: &ComponentRequestEngine,
) -> Result<Arc<ManualInjector>, ComponentError> {
    engine.request_as::<ManualInjector>(MANUAL_INJECTOR)
}

/// Factory for a capability that always runs once, in process.
pub(crate) struct BuiltinFactory<C> {
    slug: &'static str,
    title: &'static str,
    kind: ContainerKind,
    make: fn(&str) -> C,
}

impl BuiltinFactory<PlatformExecutor> {
    pub fn platform_executor() -> Self {
        Self {
            slug: PLATFORM_EXECUTOR,
            title: "Platform executor",
            kind: ContainerKind::Executor,
            make: PlatformExecutor::new,
        }
    }
}

impl BuiltinFactory<ManualInjector> {
    pub fn manual_injector() -> Self {
        Self {
            slug: MANUAL_INJECTOR,
            title: "Manual injector",
            kind: ContainerKind::Injector,
            make: ManualInjector::new,
        }
    }
}

fn autostart_id(slug: &str) -> String {
    format!("builtin:{slug}")
}

#[async_trait]
impl<C> IntegrationFactory for BuiltinFactory<C>
where
    C: Any + Send + Sync,
{
    fn type_name(&self) -> &str {
        self.slug
    }

    async fn register_catalog_entry(
        &self,
        ctx: &FactoryContext,
    ) -> Result<CatalogEntry, IntegrationError> {
        let mut entry = CatalogEntry::new(self.slug, self.title, self.kind);
        entry.verified = true;
        let (_, stored) = ctx.catalog.insert_if_absent(entry).await?;
        Ok(stored)
    }

    async fn discover_instances(
        &self,
        _ctx: &FactoryContext,
        entry: &CatalogEntry,
    ) -> Result<Vec<ConnectorInstance>, IntegrationError> {
        Ok(vec![ConnectorInstance::InMemoryAutostart {
            id: autostart_id(self.slug),
            catalog_entry_id: Some(entry.id.clone()),
        }])
    }

    fn spawn(
        &self,
        _ctx: &FactoryContext,
        _entry: &CatalogEntry,
        instance: &ConnectorInstance,
    ) -> Result<Box<dyn Integration>, IntegrationError> {
        Ok(Box::new(BuiltinIntegration {
            id: instance.id().to_string(),
            slug: self.slug,
            make: self.make,
        }))
    }
}

struct BuiltinIntegration<C> {
    id: String,
    slug: &'static str,
    make: fn(&str) -> C,
}

#[async_trait]
impl<C> Integration for BuiltinIntegration<C>
where
    C: Any + Send + Sync,
{
    fn instance_id(&self) -> &str {
        &self.id
    }

    fn in_memory(&self) -> bool {
        true
    }

    async fn start(&mut self, components: &mut ComponentSet) -> Result<(), IntegrationError> {
        let capability = Arc::new((self.make)(&self.id));
        components.insert_all([self.slug, self.id.as_str()], capability);
        Ok(())
    }
}
