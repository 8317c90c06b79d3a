use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use fleet_events::Bus;
use fleet_runtime::{ConfigKeySchema, ConfigValueType, ContainerKind};

use crate::{
    catalog::CatalogRegistry,
    components::ComponentRequestEngine,
    config::{ConnectorTemplate, SecuritySection},
    connector::ConnectorFactory,
    factory::{FactoryContext, IntegrationFactory},
    manager::{IntegrationManager, ManagerOptions},
    secrets::SecretCipher,
    security::AccessPolicy,
    store::InstanceStore,
    striped_lock::StripedLock,
    AppState,
};

pub(crate) mod fakes;

pub(crate) const ADMIN_TOKEN: &str = "admin-test-token";
pub(crate) const AGENT_TOKEN: &str = "agent-test-token";

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(crate) mod env {
    use super::*;

    pub(crate) struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: HashMap<String, Option<String>>,
    }

    pub(crate) fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
            saved: HashMap::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &str) {
            self.saved
                .entry(key.to_string())
                .or_insert_with(|| std::env::var(key).ok());
        }

        pub(crate) fn set(&mut self, key: &str, value: impl AsRef<str>) {
            self.remember(key);
            std::env::set_var(key, value.as_ref());
        }

        pub(crate) fn set_opt(&mut self, key: &str, value: Option<&str>) {
            self.remember(key);
            match value {
                Some(val) => std::env::set_var(key, val),
                None => std::env::remove_var(key),
            }
        }

        pub(crate) fn remove(&mut self, key: &str) {
            self.set_opt(key, None);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain() {
                match value {
                    Some(val) => std::env::set_var(&key, val),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }
}

/// In-memory collaborators with a small log buffer.
pub(crate) fn factory_context() -> FactoryContext {
    let bus = Bus::new(64);
    FactoryContext {
        catalog: Arc::new(CatalogRegistry::in_memory(bus.clone())),
        store: Arc::new(InstanceStore::in_memory(bus.clone(), 8)),
        cipher: Arc::new(SecretCipher::ephemeral()),
        bus,
    }
}

pub(crate) async fn manager_with_factories(
    factories: Vec<Arc<dyn IntegrationFactory>>,
) -> (Arc<IntegrationManager>, FactoryContext) {
    manager_with_dyn(factories, ManagerOptions::default()).await
}

pub(crate) async fn manager_with(
    factories: Vec<Arc<fakes::FakeFactory>>,
) -> (Arc<IntegrationManager>, FactoryContext) {
    manager_with_options(factories, ManagerOptions::default()).await
}

pub(crate) async fn manager_with_options(
    factories: Vec<Arc<fakes::FakeFactory>>,
    options: ManagerOptions,
) -> (Arc<IntegrationManager>, FactoryContext) {
    let factories = factories
        .into_iter()
        .map(|factory| factory as Arc<dyn IntegrationFactory>)
        .collect();
    manager_with_dyn(factories, options).await
}

async fn manager_with_dyn(
    factories: Vec<Arc<dyn IntegrationFactory>>,
    options: ManagerOptions,
) -> (Arc<IntegrationManager>, FactoryContext) {
    let ctx = factory_context();
    let manager = IntegrationManager::new(
        ctx.clone(),
        Arc::new(ComponentRequestEngine::new()),
        Arc::new(StripedLock::with_defaults()),
        options,
    );
    for factory in factories {
        manager
            .register_factory(factory)
            .await
            .expect("register test factory");
    }
    (manager, ctx)
}

/// Executor template with a required URL and a required secret API key.
pub(crate) fn sample_template() -> ConnectorTemplate {
    ConnectorTemplate {
        slug: "caldera".into(),
        title: "Caldera".into(),
        description: Some("Adversary emulation executor".into()),
        kind: ContainerKind::Executor,
        verified: false,
        icon: None,
        schema_version: 1,
        config: vec![
            ConfigKeySchema::new("URL", ConfigValueType::String).required(),
            ConfigKeySchema::new("API_KEY", ConfigValueType::String)
                .required()
                .password(),
        ],
    }
}

/// State with both surfaces token-protected and the sample connector's
/// catalog entry already registered.
pub(crate) async fn api_state() -> AppState {
    fleet_otel::init_for_tests();
    let access = AccessPolicy::from_config(&SecuritySection {
        admin_token: Some(ADMIN_TOKEN.into()),
        admin_token_sha256: None,
        agent_token: Some(AGENT_TOKEN.into()),
        debug: false,
    });
    let state = AppState::builder(Bus::new(64), access)
        .with_manager_options(ManagerOptions {
            start_retry_base: std::time::Duration::ZERO,
            ..ManagerOptions::default()
        })
        .build();
    state
        .manager()
        .register_factory(Arc::new(ConnectorFactory::new(sample_template())))
        .await
        .expect("register connector factory");
    state
        .manager()
        .monitor_integrations()
        .await
        .expect("initial pass");
    state
}
