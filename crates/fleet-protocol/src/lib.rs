//! Wire types exchanged between the control plane and remote agents.

use chrono::{DateTime, Utc};
use fleet_runtime::{ContainerKind, CurrentStatus, RequestedStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// RFC7807-style error payload used at service edges.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ProblemDetails {
    pub fn new(status: u16, title: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            r#type: "about:blank".to_string(),
            title: title.into(),
            status,
            detail,
            instance: None,
            code: None,
        }
    }
}

/// Pairing request sent by an agent at boot.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegisterRemoteRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(alias = "publicKey")]
    pub public_key: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RemoteRegistrationView {
    pub id: String,
    pub name: String,
    pub public_key: String,
    #[serde(default)]
    pub version: Option<String>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub last_connectivity_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RefreshConnectivityRequest {
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceStatusUpdate {
    #[serde(alias = "currentStatus")]
    pub current_status: CurrentStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceHealthCheck {
    #[serde(alias = "restartCount")]
    pub restart_count: u32,
    #[serde(default, alias = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(alias = "isInRebootLoop")]
    pub is_in_reboot_loop: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceLogsPush {
    pub logs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ManagedInstanceConfig {
    pub key: String,
    pub value: Value,
    pub is_encrypted: bool,
}

/// One instance as seen by the agent that runs it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ManagedInstance {
    pub id: String,
    pub catalog_entry_id: String,
    pub catalog_slug: String,
    pub container_kind: ContainerKind,
    pub requested_status: RequestedStatus,
    pub current_status: CurrentStatus,
    #[serde(default)]
    pub configuration: Vec<ManagedInstanceConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ManagedInstanceList {
    pub items: Vec<ManagedInstance>,
}
