use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fleet_events::Bus;
use fleet_protocol::{RegisterRemoteRequest, RemoteRegistrationView};
use fleet_topics::{TOPIC_REMOTE_CONNECTIVITY, TOPIC_REMOTE_REGISTERED};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::store::StoreError;
use crate::util;

const SNAPSHOT_FILE: &str = "remotes.json";

/// A paired remote agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct RemoteRegistration {
    pub id: String,
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub version: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub last_connectivity_check: Option<DateTime<Utc>>,
}

impl RemoteRegistration {
    pub fn view(&self) -> RemoteRegistrationView {
        RemoteRegistrationView {
            id: self.id.clone(),
            name: self.name.clone(),
            public_key: self.public_key.clone(),
            version: self.version.clone(),
            registered_at: self.registered_at,
            last_connectivity_check: self.last_connectivity_check,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registered {
    Created,
    Updated,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RemoteError {
    #[error("remote `{0}` is not registered")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl From<StoreError> for RemoteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => RemoteError::NotFound(id),
            StoreError::Persistence(msg) => RemoteError::Persistence(msg),
        }
    }
}

pub(crate) struct RemoteRegistry {
    remotes: RwLock<HashMap<String, RemoteRegistration>>,
    snapshot_path: Option<PathBuf>,
    bus: Bus,
}

impl RemoteRegistry {
    pub fn in_memory(bus: Bus) -> Self {
        Self {
            remotes: RwLock::new(HashMap::new()),
            snapshot_path: None,
            bus,
        }
    }

    pub async fn open(bus: Bus, state_dir: PathBuf) -> Result<Self, RemoteError> {
        let path = state_dir.join(SNAPSHOT_FILE);
        let loaded: Vec<RemoteRegistration> = util::read_json_snapshot(&path)
            .await
            .map_err(|err| RemoteError::Persistence(err.to_string()))?
            .unwrap_or_default();
        let remotes: HashMap<String, RemoteRegistration> = loaded
            .into_iter()
            .map(|remote| (remote.id.clone(), remote))
            .collect();
        info!(
            target: "fleet::remote",
            path = %path.display(),
            count = remotes.len(),
            "remote registrations loaded"
        );
        Ok(Self {
            remotes: RwLock::new(remotes),
            snapshot_path: Some(path),
            bus,
        })
    }

    async fn persist(
        &self,
        remotes: &HashMap<String, RemoteRegistration>,
    ) -> Result<(), RemoteError> {
        let Some(path) = self.snapshot_path.as_ref() else {
            return Ok(());
        };
        let mut rows: Vec<&RemoteRegistration> = remotes.values().collect();
        rows.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        util::write_json_snapshot(path, &rows).await.map_err(|err| {
            warn!(
                target: "fleet::remote",
                path = %path.display(),
                error = %err,
                "failed to persist remote registrations"
            );
            RemoteError::Persistence(err.to_string())
        })
    }

    /// Put back `previous` (or drop `id` when it was new) after a failed write.
    fn restore(
        remotes: &mut HashMap<String, RemoteRegistration>,
        id: &str,
        previous: Option<RemoteRegistration>,
    ) {
        match previous {
            Some(previous) => {
                remotes.insert(id.to_string(), previous);
            }
            None => {
                remotes.remove(id);
            }
        }
    }

    /// Create or update the pairing record. An absent id creates a new one.
    pub async fn register(
        &self,
        request: RegisterRemoteRequest,
    ) -> Result<(Registered, RemoteRegistration), RemoteError> {
        if request.name.trim().is_empty() {
            return Err(RemoteError::Invalid("name must not be empty".into()));
        }
        if request.public_key.trim().is_empty() {
            return Err(RemoteError::Invalid("public_key must not be empty".into()));
        }
        let id = request
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        let mut guard = self.remotes.write().await;
        let previous = guard.get(&id).cloned();
        let (outcome, registration) = match guard.get_mut(&id) {
            Some(existing) => {
                existing.name = request.name;
                existing.public_key = request.public_key;
                if request.version.is_some() {
                    existing.version = request.version;
                }
                existing.last_connectivity_check = Some(now);
                (Registered::Updated, existing.clone())
            }
            None => {
                let registration = RemoteRegistration {
                    id: id.clone(),
                    name: request.name,
                    public_key: request.public_key,
                    version: request.version,
                    registered_at: now,
                    last_connectivity_check: Some(now),
                };
                guard.insert(id.clone(), registration.clone());
                (Registered::Created, registration)
            }
        };
        if let Err(err) = self.persist(&guard).await {
            Self::restore(&mut guard, &id, previous);
            return Err(err);
        }
        drop(guard);
        info!(
            target: "fleet::remote",
            remote = %registration.id,
            name = %registration.name,
            created = outcome == Registered::Created,
            "remote registered"
        );
        self.bus.publish(
            TOPIC_REMOTE_REGISTERED,
            &json!({
                "id": registration.id,
                "name": registration.name,
                "version": registration.version,
                "created": outcome == Registered::Created,
            }),
        );
        Ok((outcome, registration))
    }

    pub async fn refresh_connectivity(
        &self,
        id: &str,
        version: Option<String>,
    ) -> Result<RemoteRegistration, RemoteError> {
        let mut guard = self.remotes.write().await;
        let remote = guard
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        let previous = remote.clone();
        remote.last_connectivity_check = Some(Utc::now());
        if version.is_some() {
            remote.version = version;
        }
        let updated = remote.clone();
        if let Err(err) = self.persist(&guard).await {
            Self::restore(&mut guard, id, Some(previous));
            return Err(err);
        }
        drop(guard);
        self.bus.publish(
            TOPIC_REMOTE_CONNECTIVITY,
            &json!({
                "id": updated.id,
                "version": updated.version,
                "checked_at": updated.last_connectivity_check,
            }),
        );
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Option<RemoteRegistration> {
        self.remotes.read().await.get(id).cloned()
    }

    pub async fn require(&self, id: &str) -> Result<RemoteRegistration, RemoteError> {
        self.get(id)
            .await
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }
}
