use std::collections::HashMap;
use std::path::PathBuf;

use fleet_events::Bus;
use fleet_runtime::{
    CurrentStatus, InstanceConfig, InstanceHealth, PersistedInstance, RequestedStatus,
};
use fleet_topics::{
    TOPIC_INSTANCE_CONFIGURED, TOPIC_INSTANCE_CREATED, TOPIC_INSTANCE_DELETED,
    TOPIC_INSTANCE_HEALTH, TOPIC_INSTANCE_REQUESTED, TOPIC_INSTANCE_STATUS,
};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::util;

const SNAPSHOT_FILE: &str = "instances.json";

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("connector instance `{0}` not found")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

/// Fields an admin (or agent self-registration) supplies for a new instance.
/// Secret values must already be sealed.
#[derive(Debug, Clone)]
pub(crate) struct NewInstance {
    pub catalog_entry_id: String,
    pub remote_id: Option<String>,
    pub configuration: Vec<InstanceConfig>,
    pub requested_status: RequestedStatus,
}

/// Persisted connector instances.
///
/// Writers are split by surface: admin handlers own `requested_status` and
/// configuration, the agent surface (or an in-process integration) owns
/// `current_status`, health and logs.
pub(crate) struct InstanceStore {
    instances: RwLock<HashMap<String, PersistedInstance>>,
    log_capacity: usize,
    snapshot_path: Option<PathBuf>,
    bus: Bus,
}

impl InstanceStore {
    pub fn in_memory(bus: Bus, log_capacity: usize) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            log_capacity,
            snapshot_path: None,
            bus,
        }
    }

    /// Load the snapshot under `state_dir` if present; later writes persist there.
    pub async fn open(
        bus: Bus,
        log_capacity: usize,
        state_dir: PathBuf,
    ) -> Result<Self, StoreError> {
        let path = state_dir.join(SNAPSHOT_FILE);
        let loaded: Vec<PersistedInstance> = util::read_json_snapshot(&path)
            .await
            .map_err(|err| StoreError::Persistence(err.to_string()))?
            .unwrap_or_default();
        let mut instances = HashMap::with_capacity(loaded.len());
        for mut instance in loaded {
            instance.logs.set_capacity(log_capacity);
            instances.insert(instance.id.clone(), instance);
        }
        info!(
            target: "fleet::store",
            path = %path.display(),
            count = instances.len(),
            "instance store loaded"
        );
        Ok(Self {
            instances: RwLock::new(instances),
            log_capacity,
            snapshot_path: Some(path),
            bus,
        })
    }

    /// Callers roll back their in-memory change when this fails.
    async fn persist(
        &self,
        instances: &HashMap<String, PersistedInstance>,
    ) -> Result<(), StoreError> {
        let Some(path) = self.snapshot_path.as_ref() else {
            return Ok(());
        };
        let mut rows: Vec<&PersistedInstance> = instances.values().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        util::write_json_snapshot(path, &rows).await.map_err(|err| {
            warn!(
                target: "fleet::store",
                path = %path.display(),
                error = %err,
                "failed to persist instance snapshot"
            );
            StoreError::Persistence(err.to_string())
        })
    }

    pub async fn create(&self, new: NewInstance) -> Result<PersistedInstance, StoreError> {
        let mut instance = PersistedInstance::new(new.catalog_entry_id, self.log_capacity);
        instance.remote_id = new.remote_id;
        instance.configuration = new.configuration;
        instance.requested_status = new.requested_status;
        let mut guard = self.instances.write().await;
        guard.insert(instance.id.clone(), instance.clone());
        if let Err(err) = self.persist(&guard).await {
            guard.remove(&instance.id);
            return Err(err);
        }
        drop(guard);
        info!(
            target: "fleet::store",
            instance = %instance.id,
            catalog = %instance.catalog_entry_id,
            requested = instance.requested_status.as_str(),
            "connector instance created"
        );
        self.bus.publish(
            TOPIC_INSTANCE_CREATED,
            &json!({
                "id": instance.id,
                "catalog_entry_id": instance.catalog_entry_id,
                "remote_id": instance.remote_id,
            }),
        );
        Ok(instance)
    }

    pub async fn get(&self, id: &str) -> Option<PersistedInstance> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<PersistedInstance> {
        self.filtered(|_| true).await
    }

    pub async fn list_for_remote(&self, remote_id: &str) -> Vec<PersistedInstance> {
        self.filtered(|instance| instance.remote_id.as_deref() == Some(remote_id))
            .await
    }

    /// Instances of `catalog_entry_id` an admin wants running.
    pub async fn requested_started(&self, catalog_entry_id: &str) -> Vec<PersistedInstance> {
        self.filtered(|instance| {
            instance.catalog_entry_id == catalog_entry_id
                && instance.requested_status == RequestedStatus::Started
        })
        .await
    }

    async fn filtered<F>(&self, keep: F) -> Vec<PersistedInstance>
    where
        F: Fn(&PersistedInstance) -> bool,
    {
        let guard = self.instances.read().await;
        let mut rows: Vec<PersistedInstance> =
            guard.values().filter(|i| keep(i)).cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows
    }

    async fn mutate<F>(&self, id: &str, apply: F) -> Result<PersistedInstance, StoreError>
    where
        F: FnOnce(&mut PersistedInstance),
    {
        let mut guard = self.instances.write().await;
        let instance = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let previous = instance.clone();
        apply(instance);
        instance.touch();
        let updated = instance.clone();
        if let Err(err) = self.persist(&guard).await {
            guard.insert(previous.id.clone(), previous);
            return Err(err);
        }
        Ok(updated)
    }

    pub async fn set_requested_status(
        &self,
        id: &str,
        status: RequestedStatus,
    ) -> Result<PersistedInstance, StoreError> {
        let updated = self
            .mutate(id, |instance| instance.requested_status = status)
            .await?;
        info!(
            target: "fleet::store",
            instance = %id,
            requested = status.as_str(),
            "requested status updated"
        );
        self.bus.publish(
            TOPIC_INSTANCE_REQUESTED,
            &json!({"id": id, "requested_status": status}),
        );
        Ok(updated)
    }

    pub async fn replace_configuration(
        &self,
        id: &str,
        configuration: Vec<InstanceConfig>,
    ) -> Result<PersistedInstance, StoreError> {
        let updated = self
            .mutate(id, |instance| {
                instance.configuration = configuration;
                instance.config_revision += 1;
            })
            .await?;
        info!(
            target: "fleet::store",
            instance = %id,
            revision = updated.config_revision,
            "configuration replaced"
        );
        self.bus.publish(
            TOPIC_INSTANCE_CONFIGURED,
            &json!({"id": id, "config_revision": updated.config_revision}),
        );
        Ok(updated)
    }

    /// Stored as reported; never checked against the requested status.
    pub async fn set_current_status(
        &self,
        id: &str,
        status: CurrentStatus,
    ) -> Result<PersistedInstance, StoreError> {
        let updated = self
            .mutate(id, |instance| instance.current_status = status)
            .await?;
        debug!(
            target: "fleet::store",
            instance = %id,
            current = status.as_str(),
            "current status recorded"
        );
        self.bus.publish(
            TOPIC_INSTANCE_STATUS,
            &json!({
                "id": id,
                "current_status": status,
                "requested_status": updated.requested_status,
            }),
        );
        Ok(updated)
    }

    pub async fn record_health(
        &self,
        id: &str,
        health: InstanceHealth,
    ) -> Result<PersistedInstance, StoreError> {
        let updated = self
            .mutate(id, |instance| instance.health = health)
            .await?;
        if updated.health.is_in_reboot_loop {
            warn!(
                target: "fleet::store",
                instance = %id,
                restart_count = updated.health.restart_count,
                "agent reports instance in reboot loop"
            );
        }
        self.bus.publish(TOPIC_INSTANCE_HEALTH, &json!({"id": id, "health": updated.health}));
        Ok(updated)
    }

    /// Returns how many lines were new.
    pub async fn append_logs(&self, id: &str, lines: Vec<String>) -> Result<usize, StoreError> {
        let mut added = 0;
        self.mutate(id, |instance| added = instance.logs.extend(lines))
            .await?;
        Ok(added)
    }

    pub async fn logs(&self, id: &str) -> Result<Vec<String>, StoreError> {
        self.instances
            .read()
            .await
            .get(id)
            .map(|instance| instance.logs.to_vec())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> Result<PersistedInstance, StoreError> {
        let mut guard = self.instances.write().await;
        let removed = guard
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Err(err) = self.persist(&guard).await {
            guard.insert(removed.id.clone(), removed);
            return Err(err);
        }
        drop(guard);
        info!(target: "fleet::store", instance = %id, "connector instance deleted");
        self.bus.publish(TOPIC_INSTANCE_DELETED, &json!({"id": id}));
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn new_instance(catalog: &str) -> NewInstance {
        NewInstance {
            catalog_entry_id: catalog.to_string(),
            remote_id: Some("remote-1".to_string()),
            configuration: vec![InstanceConfig {
                key: "URL".into(),
                value: serde_json::json!("https://example.test"),
                is_encrypted: false,
            }],
            requested_status: RequestedStatus::Started,
        }
    }

    #[tokio::test]
    async fn agent_status_does_not_touch_requested_status() {
        let store = InstanceStore::in_memory(Bus::new(8), 10);
        let created = store.create(new_instance("cat-a")).await.expect("create");
        assert_eq!(created.current_status, CurrentStatus::Unknown);

        store
            .set_current_status(&created.id, CurrentStatus::Started)
            .await
            .expect("status");
        let read = store.get(&created.id).await.expect("instance");
        assert_eq!(read.current_status, CurrentStatus::Started);
        assert_eq!(read.requested_status, RequestedStatus::Started);
    }

    #[tokio::test]
    async fn requested_started_filters_by_catalog_and_status() {
        let store = InstanceStore::in_memory(Bus::new(8), 10);
        let a = store.create(new_instance("cat-a")).await.expect("create");
        let b = store.create(new_instance("cat-a")).await.expect("create");
        store.create(new_instance("cat-b")).await.expect("create");
        store
            .set_requested_status(&b.id, RequestedStatus::Stopped)
            .await
            .expect("requested");

        let running: Vec<_> = store
            .requested_started("cat-a")
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(running, vec![a.id]);
    }

    #[tokio::test]
    async fn health_flag_is_stored_verbatim() {
        let store = InstanceStore::in_memory(Bus::new(8), 10);
        let created = store.create(new_instance("cat-a")).await.expect("create");
        for count in 1..=3 {
            store
                .record_health(
                    &created.id,
                    InstanceHealth {
                        restart_count: count,
                        started_at: Some(Utc::now()),
                        is_in_reboot_loop: true,
                        reported_at: None,
                    },
                )
                .await
                .expect("health");
        }
        let read = store.get(&created.id).await.expect("instance");
        assert_eq!(read.health.restart_count, 3);
        assert!(read.health.is_in_reboot_loop);
    }

    #[tokio::test]
    async fn log_pushes_evict_oldest_beyond_capacity() {
        let store = InstanceStore::in_memory(Bus::new(8), 3);
        let created = store.create(new_instance("cat-a")).await.expect("create");
        let lines = |range: std::ops::Range<u32>| -> Vec<String> {
            range.map(|n| format!("line {n}")).collect()
        };
        assert_eq!(store.append_logs(&created.id, lines(0..2)).await.expect("push"), 2);
        assert_eq!(store.append_logs(&created.id, lines(2..5)).await.expect("push"), 3);
        assert_eq!(
            store.logs(&created.id).await.expect("logs"),
            vec!["line 2", "line 3", "line 4"]
        );
    }

    #[tokio::test]
    async fn configuration_replacement_bumps_revision() {
        let store = InstanceStore::in_memory(Bus::new(8), 3);
        let created = store.create(new_instance("cat-a")).await.expect("create");
        let updated = store
            .replace_configuration(&created.id, Vec::new())
            .await
            .expect("replace");
        assert_eq!(updated.config_revision, created.config_revision + 1);
        assert!(updated.configuration.is_empty());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = InstanceStore::in_memory(Bus::new(8), 3);
        assert!(matches!(
            store.set_current_status("nope", CurrentStatus::Error).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.delete("nope").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let id = {
            let store = InstanceStore::open(Bus::new(8), 5, dir.path().to_path_buf())
                .await
                .expect("open");
            let created = store.create(new_instance("cat-a")).await.expect("create");
            store
                .append_logs(&created.id, vec!["hello".into()])
                .await
                .expect("logs");
            created.id
        };
        let reopened = InstanceStore::open(Bus::new(8), 5, dir.path().to_path_buf())
            .await
            .expect("reopen");
        let read = reopened.get(&id).await.expect("instance persisted");
        assert_eq!(read.logs.to_vec(), vec!["hello"]);
        assert_eq!(read.remote_id.as_deref(), Some("remote-1"));
    }

    #[tokio::test]
    async fn failed_snapshot_writes_surface_and_roll_back() {
        let dir = tempdir().expect("tempdir");
        let state_dir = dir.path().join("state");
        let store = InstanceStore::open(Bus::new(8), 5, state_dir.clone())
            .await
            .expect("open");
        let created = store.create(new_instance("cat-a")).await.expect("create");

        // A regular file where the state directory was makes every write fail.
        std::fs::remove_dir_all(&state_dir).expect("remove state dir");
        std::fs::write(&state_dir, b"not a directory").expect("block state dir");

        assert!(matches!(
            store.set_current_status(&created.id, CurrentStatus::Started).await,
            Err(StoreError::Persistence(_))
        ));
        let read = store.get(&created.id).await.expect("instance");
        assert_eq!(read.current_status, CurrentStatus::Unknown);
        assert_eq!(read.updated_at, created.updated_at);

        assert!(matches!(
            store.create(new_instance("cat-b")).await,
            Err(StoreError::Persistence(_))
        ));
        assert_eq!(store.list().await.len(), 1);

        assert!(matches!(
            store.delete(&created.id).await,
            Err(StoreError::Persistence(_))
        ));
        assert!(store.get(&created.id).await.is_some());
    }
}
