use std::{collections::HashSet, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use fleet_runtime::{CatalogEntry, ConfigKeySchema, ContainerKind, DEFAULT_LOG_CAPACITY};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::manager::ManagerOptions;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub security: SecuritySection,
    pub manager: ManagerSection,
    pub store: StoreSection,
    pub secrets: SecretsSection,
    pub connectors: Vec<ConnectorTemplate>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8092".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SecuritySection {
    pub admin_token: Option<String>,
    pub admin_token_sha256: Option<String>,
    pub agent_token: Option<String>,
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerSection {
    pub monitor_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub bootstrap_lock_timeout_ms: u64,
    pub start_retry_base_secs: u64,
    pub start_retry_max_secs: u64,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 15,
            refresh_interval_secs: 15,
            bootstrap_lock_timeout_ms: 500,
            start_retry_base_secs: 15,
            start_retry_max_secs: 300,
        }
    }
}

impl ManagerSection {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub(crate) fn options(&self) -> ManagerOptions {
        ManagerOptions {
            bootstrap_lock_timeout: Duration::from_millis(self.bootstrap_lock_timeout_ms),
            start_retry_base: Duration::from_secs(self.start_retry_base_secs),
            start_retry_max: Duration::from_secs(
                self.start_retry_max_secs.max(self.start_retry_base_secs),
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSection {
    pub state_dir: Option<PathBuf>,
    pub log_capacity: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            state_dir: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecretsSection {
    /// Base64 encoded 32-byte key.
    pub key: Option<String>,
    pub key_id: String,
}

impl Default for SecretsSection {
    fn default() -> Self {
        Self {
            key: None,
            key_id: "v1".to_string(),
        }
    }
}

/// A `[[connectors]]` block: one connector type backed by persisted instances.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConnectorTemplate {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: ContainerKind,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub config: Vec<ConfigKeySchema>,
}

fn default_schema_version() -> u32 {
    1
}

impl ConnectorTemplate {
    pub fn to_catalog_entry(&self) -> CatalogEntry {
        let mut entry = CatalogEntry::new(self.slug.clone(), self.title.clone(), self.kind)
            .with_schema(self.config.clone());
        self.apply_to(&mut entry);
        entry
    }

    /// Copy the template's presentation and schema onto `entry`.
    pub fn apply_to(&self, entry: &mut CatalogEntry) {
        entry.title = self.title.clone();
        entry.description = self.description.clone();
        entry.container_kind = self.kind;
        entry.verified = self.verified;
        entry.icon = self.icon.clone();
        entry.schema_version = self.schema_version;
        entry.config_schema = self.config.clone();
    }
}

impl ServerConfig {
    /// Load from `FLEET_CONFIG`, else `configs/default.toml` when present,
    /// else defaults; then apply `FLEET_*` environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match discovered_config_path() {
            Some((path, source)) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("read config {}", path.display()))?;
                let parsed = Self::from_toml_str(&text)
                    .with_context(|| format!("parse config {}", path.display()))?;
                info!(path = %path.display(), source, "loaded server config");
                parsed
            }
            None => {
                info!("no config file found; using built-in defaults");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(bind) = env_string("FLEET_BIND") {
            self.server.bind = bind;
        }
        if let Some(dir) = env_string("FLEET_STATE_DIR") {
            self.store.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(token) = env_string("FLEET_ADMIN_TOKEN") {
            self.security.admin_token = Some(token);
        }
        if let Some(hash) = env_string("FLEET_ADMIN_TOKEN_SHA256") {
            self.security.admin_token_sha256 = Some(hash);
        }
        if let Some(token) = env_string("FLEET_AGENT_TOKEN") {
            self.security.agent_token = Some(token);
        }
        if std::env::var_os("FLEET_DEBUG").is_some() {
            self.security.debug = crate::util::env_truthy("FLEET_DEBUG");
        }
        if let Some(raw) = env_string("FLEET_MONITOR_INTERVAL_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => self.manager.monitor_interval_secs = secs,
                Err(_) => warn!(value = %raw, "ignoring invalid FLEET_MONITOR_INTERVAL_SECS"),
            }
        }
        if let Some(key) = env_string("FLEET_SECRET_KEY") {
            self.secrets.key = Some(key);
        }
        if let Some(key_id) = env_string("FLEET_SECRET_KEY_ID") {
            self.secrets.key_id = key_id;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if self.store.log_capacity == 0 {
            bail!("store.log_capacity must be at least 1");
        }
        if self.secrets.key_id.contains(':') || self.secrets.key_id.is_empty() {
            bail!("secrets.key_id must be non-empty and must not contain ':'");
        }
        let mut slugs = HashSet::new();
        for template in &self.connectors {
            if template.slug.trim().is_empty() {
                bail!("connector template with empty slug");
            }
            if crate::builtin::BUILTIN_SLUGS.contains(&template.slug.as_str()) {
                bail!("connector slug `{}` is reserved for a built-in", template.slug);
            }
            if !slugs.insert(template.slug.as_str()) {
                bail!("duplicate connector slug `{}`", template.slug);
            }
            let mut keys = HashSet::new();
            for key in &template.config {
                if !keys.insert(key.key.as_str()) {
                    bail!("connector `{}` declares key `{}` twice", template.slug, key.key);
                }
                if let Some(default) = &key.default_value {
                    key.validate(default).with_context(|| {
                        format!("connector `{}` default for `{}`", template.slug, key.key)
                    })?;
                }
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("invalid bind address `{}`", self.server.bind))
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn discovered_config_path() -> Option<(PathBuf, &'static str)> {
    if let Some(explicit) = env_string("FLEET_CONFIG") {
        return Some((PathBuf::from(explicit), "env"));
    }
    let default = PathBuf::from("configs/default.toml");
    default.exists().then_some((default, "search"))
}
