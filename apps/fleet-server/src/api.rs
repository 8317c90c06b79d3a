//! HTTP handlers. Admin routes live under `/admin`, agent routes under `/remotes`.

pub mod catalog;
pub mod instances;
pub mod integrations;
pub mod meta;
pub mod remote;

use fleet_protocol::ManagedInstanceConfig;
use fleet_runtime::PersistedInstance;

use crate::secrets::REDACTED;

/// Configuration as shown outside the server: sealed values never leave it.
pub(crate) fn redacted_configuration(instance: &PersistedInstance) -> Vec<ManagedInstanceConfig> {
    instance
        .configuration
        .iter()
        .map(|entry| ManagedInstanceConfig {
            key: entry.key.clone(),
            value: if entry.is_encrypted {
                serde_json::Value::String(REDACTED.to_string())
            } else {
                entry.value.clone()
            },
            is_encrypted: entry.is_encrypted,
        })
        .collect()
}
