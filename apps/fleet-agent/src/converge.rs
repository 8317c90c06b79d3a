//! Drives each managed instance towards the status the admin requested.

use chrono::{DateTime, Utc};
use fleet_protocol::ManagedInstance;
use fleet_runtime::CurrentStatus;

/// What this agent believes about an instance it runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalInstance {
    pub status: CurrentStatus,
    pub started_at: Option<DateTime<Utc>>,
}

/// Outcome of one convergence step for one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub local: LocalInstance,
    /// Status to push when the platform's view differs from ours.
    pub report: Option<CurrentStatus>,
    pub log: Option<String>,
}

pub fn step(item: &ManagedInstance, local: Option<&LocalInstance>, now: DateTime<Utc>) -> Step {
    let mut next = local.cloned().unwrap_or_default();
    let want = item.requested_status.converged();
    let mut log = None;

    if next.status != want {
        match want {
            CurrentStatus::Started => {
                next.started_at = Some(now);
                log = Some(format!(
                    "{} {} started {}",
                    now.to_rfc3339(),
                    item.catalog_slug,
                    item.id
                ));
            }
            _ => {
                next.started_at = None;
                log = Some(format!(
                    "{} {} stopped {}",
                    now.to_rfc3339(),
                    item.catalog_slug,
                    item.id
                ));
            }
        }
        next.status = want;
    }

    let report = (item.current_status != next.status).then_some(next.status);
    Step {
        local: next,
        report,
        log,
    }
}
