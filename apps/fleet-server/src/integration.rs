use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;

use crate::catalog::CatalogError;
use crate::components::{ComponentRequestEngine, ComponentSet};
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub(crate) enum IntegrationError {
    #[error("integration failed to start: {0}")]
    Start(String),
    #[error("integration refresh failed: {0}")]
    Refresh(String),
    #[error("integration failed to stop cleanly: {0}")]
    Stop(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("{0}")]
    Registration(String),
    #[error("cannot {action} an integration in state {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: IntegrationState,
    },
    #[error("panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl IntegrationError {
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        IntegrationError::Panicked(message)
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum IntegrationState {
    Created,
    Starting,
    Running,
    Refreshing,
    Failed,
    Stopping,
    Stopped,
}

/// Runtime behaviour of one connector instance.
///
/// `start` contributes capabilities through the [`ComponentSet`]; they only
/// become visible once it returns `Ok`. Implementations never see their own
/// registrations again: unregistering is handled by [`LiveIntegration`].
#[async_trait]
pub(crate) trait Integration: Send + Sync {
    fn instance_id(&self) -> &str;

    /// In-memory integrations have no backing system to re-pull and no remote
    /// status to reconcile; refresh is skipped for them.
    fn in_memory(&self) -> bool {
        false
    }

    async fn start(&mut self, components: &mut ComponentSet) -> Result<(), IntegrationError>;

    async fn refresh(&mut self) -> Result<(), IntegrationError> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), IntegrationError> {
        Ok(())
    }
}

/// An integration plus its lifecycle bookkeeping. At most one exists per
/// instance id; the manager owns them all.
pub(crate) struct LiveIntegration {
    instance_id: String,
    factory_type: String,
    config_revision: u64,
    state: IntegrationState,
    identifiers: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    inner: Box<dyn Integration>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct IntegrationSnapshot {
    pub instance_id: String,
    pub factory_type: String,
    pub state: IntegrationState,
    pub in_memory: bool,
    pub identifiers: Vec<String>,
    pub config_revision: u64,
    pub started_at: Option<DateTime<Utc>>,
}

impl LiveIntegration {
    pub fn new(factory_type: &str, config_revision: u64, inner: Box<dyn Integration>) -> Self {
        Self {
            instance_id: inner.instance_id().to_string(),
            factory_type: factory_type.to_string(),
            config_revision,
            state: IntegrationState::Created,
            identifiers: Vec::new(),
            started_at: None,
            inner,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn factory_type(&self) -> &str {
        &self.factory_type
    }

    pub fn config_revision(&self) -> u64 {
        self.config_revision
    }

    pub fn state(&self) -> IntegrationState {
        self.state
    }

    pub fn snapshot(&self) -> IntegrationSnapshot {
        IntegrationSnapshot {
            instance_id: self.instance_id.clone(),
            factory_type: self.factory_type.clone(),
            state: self.state,
            in_memory: self.inner.in_memory(),
            identifiers: self.identifiers.clone(),
            config_revision: self.config_revision,
            started_at: self.started_at,
        }
    }

    /// CREATED → STARTING → RUNNING, or → FAILED. Panics count as failures.
    pub async fn start(&mut self, engine: &ComponentRequestEngine) -> Result<(), IntegrationError> {
        if self.state != IntegrationState::Created {
            return Err(IntegrationError::InvalidTransition {
                action: "start",
                state: self.state,
            });
        }
        self.state = IntegrationState::Starting;
        let mut components = ComponentSet::default();
        let outcome = AssertUnwindSafe(self.inner.start(&mut components))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(IntegrationError::from_panic(panic)));
        match outcome {
            Ok(()) => {
                if !components.is_empty() {
                    self.identifiers = engine.register_set(&self.instance_id, components);
                }
                self.state = IntegrationState::Running;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            Err(err) => {
                self.state = IntegrationState::Failed;
                Err(err)
            }
        }
    }

    /// RUNNING → REFRESHING → RUNNING. Registrations stay in place and the
    /// state returns to RUNNING whatever the outcome.
    pub async fn refresh(&mut self) -> Result<(), IntegrationError> {
        if self.state != IntegrationState::Running || self.inner.in_memory() {
            return Ok(());
        }
        self.state = IntegrationState::Refreshing;
        let outcome = AssertUnwindSafe(self.inner.refresh())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(IntegrationError::from_panic(panic)));
        self.state = IntegrationState::Running;
        outcome
    }

    /// → STOPPING → STOPPED. Safe to call repeatedly; capabilities are
    /// unregistered before the integration's own teardown runs.
    pub async fn stop(&mut self, engine: &ComponentRequestEngine) -> Result<(), IntegrationError> {
        match self.state {
            IntegrationState::Stopped => return Ok(()),
            IntegrationState::Created | IntegrationState::Failed => {
                engine.unregister_owner(&self.instance_id);
                self.state = IntegrationState::Stopped;
                return Ok(());
            }
            _ => {}
        }
        self.state = IntegrationState::Stopping;
        engine.unregister_owner(&self.instance_id);
        self.identifiers.clear();
        let outcome = AssertUnwindSafe(self.inner.stop())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(IntegrationError::from_panic(panic)));
        self.state = IntegrationState::Stopped;
        outcome
    }
}
