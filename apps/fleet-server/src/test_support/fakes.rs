//! Scriptable factories and integrations for manager tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_runtime::{
    CatalogEntry, ConnectorInstance, ContainerKind, PersistedInstance, RequestedStatus,
};

use crate::components::ComponentSet;
use crate::factory::{discover_requested, FactoryContext, IntegrationFactory};
use crate::integration::{Integration, IntegrationError};
use crate::store::NewInstance;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FakeMode {
    /// One in-memory instance per factory, like the built-ins.
    Autostart,
    /// Instances come from the store.
    Persisted,
}

/// What a started fake registers, under the factory name and the instance id.
#[derive(Debug)]
pub(crate) struct FakeCapability {
    pub owner: String,
}

#[derive(Default)]
pub(crate) struct FakeSwitches {
    fail_migrations: AtomicBool,
    fail_catalog: AtomicBool,
    panic_catalog: AtomicBool,
    fail_start: AtomicBool,
    fail_refresh: AtomicBool,
    start_delay: parking_lot::Mutex<Duration>,
    refresh_delay: parking_lot::Mutex<Duration>,
    starts: AtomicUsize,
    refreshes: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

impl FakeSwitches {
    pub fn set_fail_migrations(&self, on: bool) {
        self.fail_migrations.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_catalog(&self, on: bool) {
        self.fail_catalog.store(on, Ordering::SeqCst);
    }

    pub fn set_panic_catalog(&self, on: bool) {
        self.panic_catalog.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, on: bool) {
        self.fail_start.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_refresh(&self, on: bool) {
        self.fail_refresh.store(on, Ordering::SeqCst);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock() = delay;
    }

    /// Every start attempt, failed ones included.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Integrations started and not yet stopped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// High-water mark of `live`.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeFactory {
    name: String,
    mode: FakeMode,
    pub switches: Arc<FakeSwitches>,
}

impl FakeFactory {
    pub fn new(name: &str, mode: FakeMode) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            mode,
            switches: Arc::new(FakeSwitches::default()),
        })
    }

    /// Id of the autostart instance.
    pub fn instance_id(&self) -> String {
        format!("fake:{}", self.name)
    }

    /// A persisted, remote-owned instance of this factory's catalog entry.
    /// The catalog entry must already be registered.
    pub async fn create_instance(&self, ctx: &FactoryContext) -> PersistedInstance {
        let entry = ctx
            .catalog
            .by_slug(&self.name)
            .await
            .expect("catalog entry registered by an earlier pass");
        ctx.store
            .create(NewInstance {
                catalog_entry_id: entry.id,
                remote_id: Some(format!("{}-agent", self.name)),
                configuration: Vec::new(),
                requested_status: RequestedStatus::Started,
            })
            .await
            .expect("create instance")
    }
}

#[async_trait]
impl IntegrationFactory for FakeFactory {
    fn type_name(&self) -> &str {
        &self.name
    }

    async fn run_migrations(&self, _ctx: &FactoryContext) -> Result<(), IntegrationError> {
        if self.switches.fail_migrations.load(Ordering::SeqCst) {
            return Err(IntegrationError::Registration(format!(
                "{} migration failed",
                self.name
            )));
        }
        Ok(())
    }

    async fn register_catalog_entry(
        &self,
        ctx: &FactoryContext,
    ) -> Result<CatalogEntry, IntegrationError> {
        if self.switches.panic_catalog.load(Ordering::SeqCst) {
            panic!("{} catalog exploded", self.name);
        }
        if self.switches.fail_catalog.load(Ordering::SeqCst) {
            return Err(IntegrationError::Registration(format!(
                "{} catalog insert failed",
                self.name
            )));
        }
        let entry = CatalogEntry::new(self.name.clone(), self.name.clone(), ContainerKind::Executor);
        Ok(ctx.catalog.insert_if_absent(entry).await?.1)
    }

    async fn discover_instances(
        &self,
        ctx: &FactoryContext,
        entry: &CatalogEntry,
    ) -> Result<Vec<ConnectorInstance>, IntegrationError> {
        match self.mode {
            FakeMode::Autostart => Ok(vec![ConnectorInstance::InMemoryAutostart {
                id: self.instance_id(),
                catalog_entry_id: Some(entry.id.clone()),
            }]),
            FakeMode::Persisted => Ok(discover_requested(ctx, entry).await),
        }
    }

    fn spawn(
        &self,
        _ctx: &FactoryContext,
        _entry: &CatalogEntry,
        instance: &ConnectorInstance,
    ) -> Result<Box<dyn Integration>, IntegrationError> {
        Ok(Box::new(FakeIntegration {
            id: instance.id().to_string(),
            name: self.name.clone(),
            in_memory: self.mode == FakeMode::Autostart,
            started: false,
            switches: self.switches.clone(),
        }))
    }
}

struct FakeIntegration {
    id: String,
    name: String,
    in_memory: bool,
    started: bool,
    switches: Arc<FakeSwitches>,
}

#[async_trait]
impl Integration for FakeIntegration {
    fn instance_id(&self) -> &str {
        &self.id
    }

    fn in_memory(&self) -> bool {
        self.in_memory
    }

    async fn start(&mut self, components: &mut ComponentSet) -> Result<(), IntegrationError> {
        self.switches.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.switches.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.switches.fail_start.load(Ordering::SeqCst) {
            return Err(IntegrationError::Start(format!("{} refused to start", self.id)));
        }
        components.insert_all(
            [self.name.as_str(), self.id.as_str()],
            Arc::new(FakeCapability {
                owner: self.id.clone(),
            }),
        );
        let live = self.switches.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.switches.max_live.fetch_max(live, Ordering::SeqCst);
        self.started = true;
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), IntegrationError> {
        self.switches.refreshes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.switches.refresh_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.switches.fail_refresh.load(Ordering::SeqCst) {
            return Err(IntegrationError::Refresh(format!("{} backend unreachable", self.id)));
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), IntegrationError> {
        if std::mem::take(&mut self.started) {
            self.switches.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
