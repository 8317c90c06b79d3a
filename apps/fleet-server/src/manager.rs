use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use fleet_runtime::{CatalogEntry, ConnectorInstance, RequestedStatus};
use fleet_topics::{
    TOPIC_INTEGRATIONS_PASS_COMPLETED, TOPIC_INTEGRATION_FAILED, TOPIC_INTEGRATION_RESTARTED,
    TOPIC_INTEGRATION_STARTED, TOPIC_INTEGRATION_STOPPED,
};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::components::ComponentRequestEngine;
use crate::factory::{FactoryContext, IntegrationFactory};
use crate::integration::{
    IntegrationError, IntegrationSnapshot, IntegrationState, LiveIntegration,
};
use crate::striped_lock::{LockError, StripedLock, BOOTSTRAP};
use crate::tasks::TaskHandle;

const BOOTSTRAP_KEY: &str = "integrations";

#[derive(Clone, Debug)]
pub(crate) struct ManagerOptions {
    pub bootstrap_lock_timeout: Duration,
    pub start_retry_base: Duration,
    pub start_retry_max: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            bootstrap_lock_timeout: Duration::from_millis(500),
            start_retry_base: Duration::from_secs(15),
            start_retry_max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ManagerError {
    #[error("factory `{0}` is already registered")]
    DuplicateFactory(String),
    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct PassFailure {
    pub factory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub stage: &'static str,
    pub error: String,
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct PassReport {
    /// The bootstrap lock stayed busy; nothing was done.
    pub skipped: bool,
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
    pub deferred: Vec<String>,
    pub failures: Vec<PassFailure>,
}

impl PassReport {
    fn fail(
        &mut self,
        factory: &str,
        instance: Option<&str>,
        stage: &'static str,
        err: &IntegrationError,
    ) {
        self.failures.push(PassFailure {
            factory: factory.to_string(),
            instance: instance.map(str::to_string),
            stage,
            error: err.to_string(),
        });
    }
}

#[derive(Debug, Clone)]
struct StartBackoff {
    factory: String,
    failures: u32,
    retry_at: Instant,
}

/// Delay before the next start attempt after `failures` consecutive failures.
pub(crate) fn retry_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exponent = failures.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

async fn guarded<T, F>(future: F) -> Result<T, IntegrationError>
where
    F: std::future::Future<Output = Result<T, IntegrationError>>,
{
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(IntegrationError::from_panic(panic)))
}

/// A running integration and the last view of it that readers get.
///
/// The map holding slots is only ever locked for bookkeeping. Start, refresh
/// and stop run against the integration's own lock, so readers never wait on
/// an integration's backing system.
struct LiveSlot {
    view: IntegrationSnapshot,
    integration: Arc<Mutex<LiveIntegration>>,
}

impl LiveSlot {
    fn new(integration: LiveIntegration) -> Self {
        Self {
            view: integration.snapshot(),
            integration: Arc::new(Mutex::new(integration)),
        }
    }
}

/// Drives every registered factory through migrations, catalog registration,
/// discovery and spawn/start, and tears down integrations nobody wants.
pub(crate) struct IntegrationManager {
    ctx: FactoryContext,
    engine: Arc<ComponentRequestEngine>,
    locks: Arc<StripedLock>,
    options: ManagerOptions,
    factories: RwLock<Vec<Arc<dyn IntegrationFactory>>>,
    live: parking_lot::RwLock<HashMap<String, LiveSlot>>,
    backoff: parking_lot::Mutex<HashMap<String, StartBackoff>>,
}

impl IntegrationManager {
    pub fn new(
        ctx: FactoryContext,
        engine: Arc<ComponentRequestEngine>,
        locks: Arc<StripedLock>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            engine,
            locks,
            options,
            factories: RwLock::new(Vec::new()),
            live: parking_lot::RwLock::new(HashMap::new()),
            backoff: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub async fn register_factory(
        &self,
        factory: Arc<dyn IntegrationFactory>,
    ) -> Result<(), ManagerError> {
        let mut guard = self.factories.write().await;
        if guard
            .iter()
            .any(|existing| existing.type_name() == factory.type_name())
        {
            return Err(ManagerError::DuplicateFactory(factory.type_name().to_string()));
        }
        debug!(target: "fleet::manager", factory = factory.type_name(), "factory registered");
        guard.push(factory);
        Ok(())
    }

    pub async fn factory_names(&self) -> Vec<String> {
        self.factories
            .read()
            .await
            .iter()
            .map(|factory| factory.type_name().to_string())
            .collect()
    }

    pub fn engine(&self) -> Arc<ComponentRequestEngine> {
        self.engine.clone()
    }

    /// One reconcile pass. Skipped when another pass holds the bootstrap
    /// lock for longer than the configured timeout.
    pub async fn monitor_integrations(&self) -> Result<PassReport, ManagerError> {
        let mut report = PassReport::default();
        let Some(_bootstrap) = self
            .locks
            .try_acquire_for(&BOOTSTRAP, BOOTSTRAP_KEY, self.options.bootstrap_lock_timeout)
            .await?
        else {
            debug!(target: "fleet::manager", "bootstrap lock busy; pass skipped");
            report.skipped = true;
            return Ok(report);
        };
        let started = Instant::now();
        let factories = self.factories.read().await.clone();
        for factory in factories {
            self.reconcile_factory(factory.as_ref(), &mut report).await;
        }
        let live = self.live.read().len();
        if report.started.is_empty()
            && report.stopped.is_empty()
            && report.restarted.is_empty()
            && report.failures.is_empty()
        {
            debug!(target: "fleet::manager", live, "integrations pass: no changes");
        } else {
            info!(
                target: "fleet::manager",
                live,
                started = report.started.len(),
                stopped = report.stopped.len(),
                restarted = report.restarted.len(),
                deferred = report.deferred.len(),
                failures = report.failures.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "integrations pass completed"
            );
        }
        self.ctx.bus.publish(TOPIC_INTEGRATIONS_PASS_COMPLETED, &report);
        Ok(report)
    }

    async fn reconcile_factory(&self, factory: &dyn IntegrationFactory, report: &mut PassReport) {
        let type_name = factory.type_name().to_string();

        if let Err(err) = guarded(factory.run_migrations(&self.ctx)).await {
            self.registration_failed(&type_name, "migrations", &err, report);
            self.retire_unrequested(&type_name, report).await;
            return;
        }
        let entry = match guarded(factory.register_catalog_entry(&self.ctx)).await {
            Ok(entry) => entry,
            Err(err) => {
                self.registration_failed(&type_name, "catalog", &err, report);
                self.retire_unrequested(&type_name, report).await;
                return;
            }
        };
        let discovered = match guarded(factory.discover_instances(&self.ctx, &entry)).await {
            Ok(instances) => instances,
            Err(err) => {
                self.registration_failed(&type_name, "discovery", &err, report);
                self.retire_unrequested(&type_name, report).await;
                return;
            }
        };

        let wanted: HashSet<&str> = discovered.iter().map(|instance| instance.id()).collect();
        self.backoff
            .lock()
            .retain(|id, backoff| backoff.factory != type_name || wanted.contains(id.as_str()));

        let unwanted: Vec<(String, LiveSlot)> = {
            let mut live = self.live.write();
            let ids: Vec<String> = live
                .iter()
                .filter(|(id, slot)| {
                    slot.view.factory_type == type_name && !wanted.contains(id.as_str())
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| live.remove(&id).map(|slot| (id, slot)))
                .collect()
        };
        for (id, slot) in unwanted {
            self.stop_slot(slot, "no longer requested").await;
            report.stopped.push(id);
        }

        let mut seen = HashSet::new();
        for instance in &discovered {
            let id = instance.id().to_string();
            if !seen.insert(id.clone()) {
                continue;
            }
            let mut restarting = false;
            let running_revision = self
                .live
                .read()
                .get(&id)
                .map(|slot| slot.view.config_revision);
            if let Some(running_revision) = running_revision {
                if running_revision == instance.config_revision() {
                    continue;
                }
                let stale = self.live.write().remove(&id);
                if let Some(stale) = stale {
                    info!(
                        target: "fleet::manager",
                        factory = %type_name,
                        instance = %id,
                        from_revision = running_revision,
                        to_revision = instance.config_revision(),
                        "configuration changed; restarting integration"
                    );
                    self.stop_slot(stale, "configuration changed").await;
                    restarting = true;
                }
            }
            if self.is_deferred(&id) {
                report.deferred.push(id);
                continue;
            }
            match self.spawn_and_start(factory, &entry, instance).await {
                Ok(integration) => {
                    self.backoff.lock().remove(&id);
                    let topic = if restarting {
                        report.restarted.push(id.clone());
                        TOPIC_INTEGRATION_RESTARTED
                    } else {
                        report.started.push(id.clone());
                        TOPIC_INTEGRATION_STARTED
                    };
                    info!(
                        target: "fleet::manager",
                        factory = %type_name,
                        instance = %id,
                        restarted = restarting,
                        "integration running"
                    );
                    self.ctx.bus.publish(
                        topic,
                        &json!({"instance": id, "factory": type_name, "catalog_slug": entry.slug}),
                    );
                    self.live.write().insert(id, LiveSlot::new(integration));
                }
                Err((stage, err)) => {
                    let delay = self.record_start_failure(&type_name, &id);
                    warn!(
                        target: "fleet::manager",
                        factory = %type_name,
                        instance = %id,
                        stage,
                        error = %err,
                        retry_in_secs = delay.as_secs(),
                        "integration failed to start"
                    );
                    self.ctx.bus.publish(
                        TOPIC_INTEGRATION_FAILED,
                        &json!({
                            "instance": id,
                            "factory": type_name,
                            "stage": stage,
                            "error": err.to_string(),
                        }),
                    );
                    report.fail(&type_name, Some(&id), stage, &err);
                }
            }
        }
    }

    async fn spawn_and_start(
        &self,
        factory: &dyn IntegrationFactory,
        entry: &CatalogEntry,
        instance: &ConnectorInstance,
    ) -> Result<LiveIntegration, (&'static str, IntegrationError)> {
        let inner = std::panic::catch_unwind(AssertUnwindSafe(|| {
            factory.spawn(&self.ctx, entry, instance)
        }))
        .unwrap_or_else(|panic| Err(IntegrationError::from_panic(panic)))
        .map_err(|err| ("spawn", err))?;
        let mut integration =
            LiveIntegration::new(factory.type_name(), instance.config_revision(), inner);
        integration
            .start(&self.engine)
            .await
            .map_err(|err| ("start", err))?;
        Ok(integration)
    }

    fn registration_failed(
        &self,
        factory: &str,
        stage: &'static str,
        err: &IntegrationError,
        report: &mut PassReport,
    ) {
        warn!(
            target: "fleet::manager",
            factory,
            stage,
            error = %err,
            "factory registration failed; running integrations kept"
        );
        self.ctx.bus.publish(
            TOPIC_INTEGRATION_FAILED,
            &json!({"factory": factory, "stage": stage, "error": err.to_string()}),
        );
        report.fail(factory, None, stage, err);
    }

    /// Teardown for a factory whose registration failed this pass: persisted
    /// integrations whose record is gone or no longer requested STARTED are
    /// stopped straight from the store. Everything else keeps running.
    async fn retire_unrequested(&self, type_name: &str, report: &mut PassReport) {
        let candidates: Vec<String> = self
            .live
            .read()
            .iter()
            .filter(|(_, slot)| slot.view.factory_type == type_name && !slot.view.in_memory)
            .map(|(id, _)| id.clone())
            .collect();
        for id in candidates {
            let requested = self
                .ctx
                .store
                .get(&id)
                .await
                .map(|instance| instance.requested_status);
            if requested == Some(RequestedStatus::Started) {
                continue;
            }
            let slot = self.live.write().remove(&id);
            if let Some(slot) = slot {
                let reason = if requested.is_none() {
                    "instance deleted"
                } else {
                    "no longer requested"
                };
                self.stop_slot(slot, reason).await;
                report.stopped.push(id);
            }
        }
    }

    async fn stop_slot(&self, slot: LiveSlot, reason: &'static str) {
        let mut integration = slot.integration.lock().await;
        self.stop_live(&mut integration, reason).await;
    }

    async fn stop_live(&self, integration: &mut LiveIntegration, reason: &'static str) {
        if let Err(err) = integration.stop(&self.engine).await {
            warn!(
                target: "fleet::manager",
                instance = %integration.instance_id(),
                error = %err,
                "integration stop reported error"
            );
        }
        info!(
            target: "fleet::manager",
            factory = %integration.factory_type(),
            instance = %integration.instance_id(),
            reason,
            "integration stopped"
        );
        self.ctx.bus.publish(
            TOPIC_INTEGRATION_STOPPED,
            &json!({
                "instance": integration.instance_id(),
                "factory": integration.factory_type(),
                "reason": reason,
            }),
        );
    }

    fn is_deferred(&self, id: &str) -> bool {
        self.backoff
            .lock()
            .get(id)
            .map(|backoff| backoff.retry_at > Instant::now())
            .unwrap_or(false)
    }

    fn record_start_failure(&self, factory: &str, id: &str) -> Duration {
        let mut guard = self.backoff.lock();
        let failures = guard.get(id).map(|b| b.failures).unwrap_or(0) + 1;
        let delay = retry_delay(
            failures,
            self.options.start_retry_base,
            self.options.start_retry_max,
        );
        guard.insert(
            id.to_string(),
            StartBackoff {
                factory: factory.to_string(),
                failures,
                retry_at: Instant::now() + delay,
            },
        );
        delay
    }

    /// Replace the reader view of `id` if the slot still holds `integration`.
    fn publish_view(
        &self,
        id: &str,
        integration: &Arc<Mutex<LiveIntegration>>,
        view: IntegrationSnapshot,
    ) {
        let mut live = self.live.write();
        if let Some(slot) = live.get_mut(id) {
            if Arc::ptr_eq(&slot.integration, integration) {
                slot.view = view;
            }
        }
    }

    /// Periodic RUNNING → REFRESHING → RUNNING step. Returns how many
    /// integrations refreshed without error.
    pub async fn refresh_integrations(&self) -> usize {
        let targets: Vec<(String, Arc<Mutex<LiveIntegration>>)> = self
            .live
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.integration.clone()))
            .collect();
        let mut ok = 0;
        for (id, integration) in targets {
            let mut guard = integration.lock().await;
            // Stopped by a pass while this refresh waited for it.
            if guard.state() != IntegrationState::Running {
                continue;
            }
            let mut view = guard.snapshot();
            if !view.in_memory {
                view.state = IntegrationState::Refreshing;
                self.publish_view(&id, &integration, view);
            }
            match guard.refresh().await {
                Ok(()) => ok += 1,
                Err(err) => warn!(
                    target: "fleet::manager",
                    instance = %id,
                    error = %err,
                    "integration refresh failed"
                ),
            }
            self.publish_view(&id, &integration, guard.snapshot());
        }
        ok
    }

    pub fn snapshot(&self) -> Vec<IntegrationSnapshot> {
        let mut rows: Vec<IntegrationSnapshot> =
            self.live.read().values().map(|slot| slot.view.clone()).collect();
        rows.sort_by(|a, b| {
            a.factory_type
                .cmp(&b.factory_type)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        rows
    }

    pub fn is_live(&self, instance_id: &str) -> bool {
        self.live.read().contains_key(instance_id)
    }

    /// Stop everything. Waits for any in-flight pass first.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let _bootstrap = self.locks.acquire(&BOOTSTRAP, BOOTSTRAP_KEY).await?;
        let slots: Vec<LiveSlot> = self.live.write().drain().map(|(_, slot)| slot).collect();
        let count = slots.len();
        for slot in slots {
            self.stop_slot(slot, "shutdown").await;
        }
        info!(target: "fleet::manager", stopped = count, "integrations shut down");
        Ok(())
    }

    /// Runs a pass every `every` until `cancel` fires. A pass in flight when
    /// it fires still completes.
    pub fn spawn_monitor_loop(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> TaskHandle {
        let manager = Arc::clone(self);
        TaskHandle::new(
            "integrations.monitor",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(target: "fleet::manager", "monitor loop cancelled");
                            break;
                        }
                        _ = ticker.tick() => {
                            if let Err(err) = manager.monitor_integrations().await {
                                warn!(target: "fleet::manager", error = %err, "integrations pass aborted");
                            }
                        }
                    }
                }
            }),
        )
    }

    pub fn spawn_refresh_loop(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> TaskHandle {
        let manager = Arc::clone(self);
        TaskHandle::new(
            "integrations.refresh",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick completes immediately; the initial pass already started everything.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(target: "fleet::manager", "refresh loop cancelled");
                            break;
                        }
                        _ = ticker.tick() => {
                            manager.refresh_integrations().await;
                        }
                    }
                }
            }),
        )
    }

    #[cfg(test)]
    fn backoff_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backoff.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
