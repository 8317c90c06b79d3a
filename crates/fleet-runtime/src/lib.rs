//! Catalog and connector-instance data model shared by the control plane
//! and remote agents.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod config;

pub use config::{ConfigError, ConfigFormat, ConfigKeySchema, ConfigValueType};

pub type CatalogEntryId = String;
pub type InstanceId = String;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerKind {
    Executor,
    Injector,
    Collector,
}

impl ContainerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Executor => "EXECUTOR",
            ContainerKind::Injector => "INJECTOR",
            ContainerKind::Collector => "COLLECTOR",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "executor" => Some(ContainerKind::Executor),
            "injector" => Some(ContainerKind::Injector),
            "collector" => Some(ContainerKind::Collector),
            _ => None,
        }
    }
}

/// Connector template. Owned by the factory that registers it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CatalogEntry {
    pub id: CatalogEntryId,
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub container_kind: ContainerKind,
    #[serde(default)]
    pub config_schema: Vec<ConfigKeySchema>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_schema_version() -> u32 {
    1
}

impl CatalogEntry {
    pub fn new(
        slug: impl Into<String>,
        title: impl Into<String>,
        container_kind: ContainerKind,
    ) -> Self {
        let slug = slug.into();
        let now = Utc::now();
        Self {
            id: Self::id_for_slug(&slug),
            slug,
            title: title.into(),
            description: None,
            container_kind,
            config_schema: Vec::new(),
            verified: false,
            icon: None,
            schema_version: default_schema_version(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Derived from the slug, so an entry registered without a state
    /// directory keeps the id its persisted instances point at.
    pub fn id_for_slug(slug: &str) -> CatalogEntryId {
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, format!("fleet.catalog.{slug}").as_bytes())
            .to_string()
    }

    pub fn with_schema(mut self, schema: Vec<ConfigKeySchema>) -> Self {
        self.config_schema = schema;
        self
    }

    pub fn schema_for(&self, key: &str) -> Option<&ConfigKeySchema> {
        self.config_schema.iter().find(|entry| entry.key == key)
    }

    /// Check and complete a set of raw configuration values against the schema.
    ///
    /// Unknown keys are rejected, defaults are filled in for missing optional
    /// keys, and required keys without a value or default are errors. The
    /// output follows schema order.
    pub fn resolve_configuration(
        &self,
        supplied: &BTreeMap<String, Value>,
    ) -> Result<Vec<(ConfigKeySchema, Value)>, ConfigError> {
        if let Some(unknown) = supplied.keys().find(|key| self.schema_for(key).is_none()) {
            return Err(ConfigError::UnknownKey(unknown.clone()));
        }
        let mut resolved = Vec::with_capacity(self.config_schema.len());
        for schema in &self.config_schema {
            match supplied.get(&schema.key) {
                Some(Value::Null) | None => match schema.default_value.clone() {
                    Some(default) => resolved.push((schema.clone(), default)),
                    None if schema.required => {
                        return Err(ConfigError::MissingRequired(schema.key.clone()))
                    }
                    None => {}
                },
                Some(value) => {
                    schema.validate(value)?;
                    resolved.push((schema.clone(), value.clone()));
                }
            }
        }
        Ok(resolved)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CurrentStatus {
    #[default]
    Unknown,
    Starting,
    Started,
    Stopped,
    Error,
}

impl CurrentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurrentStatus::Unknown => "UNKNOWN",
            CurrentStatus::Starting => "STARTING",
            CurrentStatus::Started => "STARTED",
            CurrentStatus::Stopped => "STOPPED",
            CurrentStatus::Error => "ERROR",
        }
    }

    pub fn from_slug(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "starting" => CurrentStatus::Starting,
            "started" | "running" => CurrentStatus::Started,
            "stopped" => CurrentStatus::Stopped,
            "error" | "failed" => CurrentStatus::Error,
            _ => CurrentStatus::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestedStatus {
    #[default]
    Started,
    Stopped,
}

impl RequestedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestedStatus::Started => "STARTED",
            RequestedStatus::Stopped => "STOPPED",
        }
    }

    /// What an agent converging towards this request should report.
    pub fn converged(&self) -> CurrentStatus {
        match self {
            RequestedStatus::Started => CurrentStatus::Started,
            RequestedStatus::Stopped => CurrentStatus::Stopped,
        }
    }
}

/// Agent-reported health. `is_in_reboot_loop` is whatever the agent computed;
/// the platform stores it verbatim.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct InstanceHealth {
    pub restart_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub is_in_reboot_loop: bool,
    #[serde(default)]
    pub reported_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    pub key: String,
    pub value: Value,
    #[serde(default)]
    pub is_encrypted: bool,
}

/// Capacity-bounded, insertion-ordered set of log lines.
///
/// A line already present is not added twice. When full, the oldest line is
/// evicted first.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogBuffer {
    capacity: usize,
    lines: VecDeque<String>,
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Returns how many of `lines` were new.
    pub fn extend<I, S>(&mut self, lines: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for line in lines {
            let line = line.into();
            if self.lines.contains(&line) {
                continue;
            }
            while self.lines.len() >= self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line);
            added += 1;
        }
        added
    }

    /// Shrinking drops the oldest lines.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// A connector instance with a persisted record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersistedInstance {
    pub id: InstanceId,
    pub catalog_entry_id: CatalogEntryId,
    /// Remote agent registration that runs this instance; `None` runs in-process.
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub configuration: Vec<InstanceConfig>,
    #[serde(default)]
    pub current_status: CurrentStatus,
    #[serde(default)]
    pub requested_status: RequestedStatus,
    #[serde(default)]
    pub health: InstanceHealth,
    #[serde(default)]
    pub logs: LogBuffer,
    /// Bumped on every configuration change.
    #[serde(default)]
    pub config_revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedInstance {
    pub fn new(catalog_entry_id: impl Into<String>, log_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            catalog_entry_id: catalog_entry_id.into(),
            remote_id: None,
            configuration: Vec::new(),
            current_status: CurrentStatus::Unknown,
            requested_status: RequestedStatus::Started,
            health: InstanceHealth::default(),
            logs: LogBuffer::with_capacity(log_capacity),
            config_revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn config_value(&self, key: &str) -> Option<&InstanceConfig> {
        self.configuration.iter().find(|entry| entry.key == key)
    }

    pub fn is_remote(&self) -> bool {
        self.remote_id.is_some()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Anything a factory can discover and spawn an integration for.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectorInstance {
    /// Built-in capability with no external process and no persisted state.
    InMemoryAutostart {
        id: InstanceId,
        catalog_entry_id: Option<CatalogEntryId>,
    },
    Persisted(Box<PersistedInstance>),
}

impl ConnectorInstance {
    pub fn autostart(id: impl Into<String>) -> Self {
        ConnectorInstance::InMemoryAutostart {
            id: id.into(),
            catalog_entry_id: None,
        }
    }

    pub fn persisted(instance: PersistedInstance) -> Self {
        ConnectorInstance::Persisted(Box::new(instance))
    }

    pub fn id(&self) -> &str {
        match self {
            ConnectorInstance::InMemoryAutostart { id, .. } => id,
            ConnectorInstance::Persisted(instance) => &instance.id,
        }
    }

    pub fn catalog_entry_id(&self) -> Option<&str> {
        match self {
            ConnectorInstance::InMemoryAutostart {
                catalog_entry_id, ..
            } => catalog_entry_id.as_deref(),
            ConnectorInstance::Persisted(instance) => Some(&instance.catalog_entry_id),
        }
    }

    /// Autostart instances are always requested as started.
    pub fn requested_status(&self) -> RequestedStatus {
        match self {
            ConnectorInstance::InMemoryAutostart { .. } => RequestedStatus::Started,
            ConnectorInstance::Persisted(instance) => instance.requested_status,
        }
    }

    pub fn config_revision(&self) -> u64 {
        match self {
            ConnectorInstance::InMemoryAutostart { .. } => 0,
            ConnectorInstance::Persisted(instance) => instance.config_revision,
        }
    }

    pub fn as_persisted(&self) -> Option<&PersistedInstance> {
        match self {
            ConnectorInstance::Persisted(instance) => Some(instance),
            ConnectorInstance::InMemoryAutostart { .. } => None,
        }
    }
}
