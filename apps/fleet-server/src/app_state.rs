use std::sync::Arc;

use fleet_events::Bus;
use fleet_runtime::DEFAULT_LOG_CAPACITY;

use crate::{
    catalog::CatalogRegistry,
    components::ComponentRequestEngine,
    factory::FactoryContext,
    manager::{IntegrationManager, ManagerOptions},
    remote::RemoteRegistry,
    secrets::SecretCipher,
    security::AccessPolicy,
    store::InstanceStore,
    striped_lock::StripedLock,
};

#[derive(Clone)]
pub(crate) struct AppState {
    bus: Bus,
    access: Arc<AccessPolicy>,
    catalog: Arc<CatalogRegistry>,
    store: Arc<InstanceStore>,
    remotes: Arc<RemoteRegistry>,
    cipher: Arc<SecretCipher>,
    engine: Arc<ComponentRequestEngine>,
    manager: Arc<IntegrationManager>,
    endpoints: Arc<Vec<String>>,
}

impl AppState {
    pub fn bus(&self) -> Bus {
        self.bus.clone()
    }

    pub fn access(&self) -> &AccessPolicy {
        &self.access
    }

    pub fn catalog(&self) -> Arc<CatalogRegistry> {
        self.catalog.clone()
    }

    pub fn store(&self) -> Arc<InstanceStore> {
        self.store.clone()
    }

    pub fn remotes(&self) -> Arc<RemoteRegistry> {
        self.remotes.clone()
    }

    pub fn cipher(&self) -> Arc<SecretCipher> {
        self.cipher.clone()
    }

    pub fn engine(&self) -> Arc<ComponentRequestEngine> {
        self.engine.clone()
    }

    pub fn manager(&self) -> Arc<IntegrationManager> {
        self.manager.clone()
    }

    pub fn endpoints(&self) -> Arc<Vec<String>> {
        self.endpoints.clone()
    }

    pub(crate) fn builder(bus: Bus, access: AccessPolicy) -> AppStateBuilder {
        AppStateBuilder {
            bus,
            access,
            catalog: None,
            store: None,
            remotes: None,
            cipher: None,
            manager_options: ManagerOptions::default(),
            endpoints: None,
        }
    }
}

pub(crate) struct AppStateBuilder {
    bus: Bus,
    access: AccessPolicy,
    catalog: Option<Arc<CatalogRegistry>>,
    store: Option<Arc<InstanceStore>>,
    remotes: Option<Arc<RemoteRegistry>>,
    cipher: Option<Arc<SecretCipher>>,
    manager_options: ManagerOptions,
    endpoints: Option<Arc<Vec<String>>>,
}

impl AppStateBuilder {
    pub(crate) fn with_catalog(mut self, catalog: Arc<CatalogRegistry>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub(crate) fn with_store(mut self, store: Arc<InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub(crate) fn with_remotes(mut self, remotes: Arc<RemoteRegistry>) -> Self {
        self.remotes = Some(remotes);
        self
    }

    pub(crate) fn with_cipher(mut self, cipher: Arc<SecretCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub(crate) fn with_manager_options(mut self, options: ManagerOptions) -> Self {
        self.manager_options = options;
        self
    }

    pub(crate) fn with_endpoints(mut self, endpoints: Arc<Vec<String>>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub(crate) fn build(self) -> AppState {
        let store = self.store.unwrap_or_else(|| {
            Arc::new(InstanceStore::in_memory(self.bus.clone(), DEFAULT_LOG_CAPACITY))
        });
        let remotes = self
            .remotes
            .unwrap_or_else(|| Arc::new(RemoteRegistry::in_memory(self.bus.clone())));
        let cipher = self
            .cipher
            .unwrap_or_else(|| Arc::new(SecretCipher::ephemeral()));
        let locks = Arc::new(StripedLock::with_defaults());
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(CatalogRegistry::in_memory(self.bus.clone())));
        let engine = Arc::new(ComponentRequestEngine::new());
        let ctx = FactoryContext {
            catalog: catalog.clone(),
            store: store.clone(),
            cipher: cipher.clone(),
            bus: self.bus.clone(),
        };
        let manager =
            IntegrationManager::new(ctx, engine.clone(), locks, self.manager_options);
        AppState {
            bus: self.bus,
            access: Arc::new(self.access),
            catalog,
            store,
            remotes,
            cipher,
            engine,
            manager,
            endpoints: self.endpoints.unwrap_or_default(),
        }
    }
}
