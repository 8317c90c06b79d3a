use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use fleet_events::Bus;
use fleet_runtime::CatalogEntry;
use fleet_topics::{TOPIC_CATALOG_ENTRY_MIGRATED, TOPIC_CATALOG_ENTRY_REGISTERED};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::util;

const SNAPSHOT_FILE: &str = "catalog.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CatalogUpsert {
    Inserted,
    Existing,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CatalogError {
    #[error("catalog persistence failure: {0}")]
    Persistence(String),
}

#[derive(Default)]
struct CatalogState {
    by_id: HashMap<String, CatalogEntry>,
    slug_index: HashMap<String, String>,
}

impl CatalogState {
    fn put(&mut self, entry: CatalogEntry) {
        self.slug_index.insert(entry.slug.clone(), entry.id.clone());
        self.by_id.insert(entry.id.clone(), entry);
    }

    fn take(&mut self, entry: &CatalogEntry) {
        self.slug_index.remove(&entry.slug);
        self.by_id.remove(&entry.id);
    }
}

/// Connector templates, keyed by id with a unique slug index.
///
/// Entries are written only by their owning factory: once on first
/// registration and afterwards only through [`CatalogRegistry::migrate`].
/// With a state directory the entries survive restarts, so a template whose
/// schema version moved on since the last run is migrated, not re-inserted.
pub(crate) struct CatalogRegistry {
    state: RwLock<CatalogState>,
    snapshot_path: Option<PathBuf>,
    bus: Bus,
}

impl CatalogRegistry {
    pub fn in_memory(bus: Bus) -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
            snapshot_path: None,
            bus,
        }
    }

    pub async fn open(bus: Bus, state_dir: PathBuf) -> Result<Self, CatalogError> {
        let path = state_dir.join(SNAPSHOT_FILE);
        let loaded: Vec<CatalogEntry> = util::read_json_snapshot(&path)
            .await
            .map_err(|err| CatalogError::Persistence(err.to_string()))?
            .unwrap_or_default();
        let mut state = CatalogState::default();
        for entry in loaded {
            state.put(entry);
        }
        info!(
            target: "fleet::catalog",
            path = %path.display(),
            count = state.by_id.len(),
            "catalog loaded"
        );
        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path),
            bus,
        })
    }

    async fn persist(&self, state: &CatalogState) -> Result<(), CatalogError> {
        let Some(path) = self.snapshot_path.as_ref() else {
            return Ok(());
        };
        let mut rows: Vec<&CatalogEntry> = state.by_id.values().collect();
        rows.sort_by(|a, b| a.slug.cmp(&b.slug));
        util::write_json_snapshot(path, &rows).await.map_err(|err| {
            warn!(
                target: "fleet::catalog",
                path = %path.display(),
                error = %err,
                "failed to persist catalog"
            );
            CatalogError::Persistence(err.to_string())
        })
    }

    /// Insert `entry` unless an entry with the same slug already exists.
    /// Returns the stored entry either way.
    pub async fn insert_if_absent(
        &self,
        entry: CatalogEntry,
    ) -> Result<(CatalogUpsert, CatalogEntry), CatalogError> {
        let mut guard = self.state.write().await;
        if let Some(existing) = guard
            .slug_index
            .get(&entry.slug)
            .and_then(|id| guard.by_id.get(id))
        {
            return Ok((CatalogUpsert::Existing, existing.clone()));
        }
        guard.put(entry.clone());
        if let Err(err) = self.persist(&guard).await {
            guard.take(&entry);
            return Err(err);
        }
        drop(guard);
        info!(
            target: "fleet::catalog",
            slug = %entry.slug,
            id = %entry.id,
            kind = entry.container_kind.as_str(),
            "catalog entry registered"
        );
        self.bus.publish(
            TOPIC_CATALOG_ENTRY_REGISTERED,
            &json!({"id": entry.id, "slug": entry.slug, "kind": entry.container_kind}),
        );
        Ok((CatalogUpsert::Inserted, entry))
    }

    /// Apply a schema migration to the entry with `slug`. `apply` returns
    /// whether it changed anything; only changed entries are stamped.
    pub async fn migrate<F>(&self, slug: &str, apply: F) -> Result<Option<CatalogEntry>, CatalogError>
    where
        F: FnOnce(&mut CatalogEntry) -> bool,
    {
        let mut guard = self.state.write().await;
        let Some(id) = guard.slug_index.get(slug).cloned() else {
            return Ok(None);
        };
        let Some(entry) = guard.by_id.get_mut(&id) else {
            return Ok(None);
        };
        let previous = entry.clone();
        if !apply(entry) {
            return Ok(Some(previous));
        }
        entry.updated_at = Utc::now();
        let updated = entry.clone();
        if let Err(err) = self.persist(&guard).await {
            guard.put(previous);
            return Err(err);
        }
        drop(guard);
        let from_version = previous.schema_version;
        info!(
            target: "fleet::catalog",
            slug,
            from_version,
            to_version = updated.schema_version,
            "catalog entry migrated"
        );
        self.bus.publish(
            TOPIC_CATALOG_ENTRY_MIGRATED,
            &json!({
                "id": updated.id,
                "slug": updated.slug,
                "from_version": from_version,
                "to_version": updated.schema_version,
            }),
        );
        Ok(Some(updated))
    }

    pub async fn get(&self, id: &str) -> Option<CatalogEntry> {
        self.state.read().await.by_id.get(id).cloned()
    }

    pub async fn by_slug(&self, slug: &str) -> Option<CatalogEntry> {
        let guard = self.state.read().await;
        guard
            .slug_index
            .get(slug)
            .and_then(|id| guard.by_id.get(id))
            .cloned()
    }

    pub async fn list(&self) -> Vec<CatalogEntry> {
        let guard = self.state.read().await;
        let mut entries: Vec<CatalogEntry> = guard.by_id.values().cloned().collect();
        entries.sort_by(|a, b| a.slug.cmp(&b.slug));
        entries
    }
}
