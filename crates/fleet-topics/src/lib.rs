//! Canonical event topic constants shared by the control plane.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Catalog
pub const TOPIC_CATALOG_ENTRY_MIGRATED: &str = "catalog.entry.migrated";
pub const TOPIC_CATALOG_ENTRY_REGISTERED: &str = "catalog.entry.registered";

// Connector instances
pub const TOPIC_INSTANCE_CONFIGURED: &str = "connector.instance.configured";
pub const TOPIC_INSTANCE_CREATED: &str = "connector.instance.created";
pub const TOPIC_INSTANCE_DELETED: &str = "connector.instance.deleted";
pub const TOPIC_INSTANCE_HEALTH: &str = "connector.instance.health";
pub const TOPIC_INSTANCE_REQUESTED: &str = "connector.instance.requested";
pub const TOPIC_INSTANCE_STATUS: &str = "connector.instance.status";

// Integrations (runtime)
pub const TOPIC_INTEGRATION_FAILED: &str = "integration.failed";
pub const TOPIC_INTEGRATION_RESTARTED: &str = "integration.restarted";
pub const TOPIC_INTEGRATION_STARTED: &str = "integration.started";
pub const TOPIC_INTEGRATION_STOPPED: &str = "integration.stopped";
pub const TOPIC_INTEGRATIONS_PASS_COMPLETED: &str = "integrations.pass.completed";

// Remote agents
pub const TOPIC_REMOTE_CONNECTIVITY: &str = "remote.connectivity";
pub const TOPIC_REMOTE_REGISTERED: &str = "remote.registered";

// Service
pub const TOPIC_SERVICE_START: &str = "service.start";
pub const TOPIC_SERVICE_STOP: &str = "service.stop";
