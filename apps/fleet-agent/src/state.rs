//! Agent state file: assigned remote id, restart history and reboot-loop
//! detection.
//!
//! The platform trusts the agent's `isInRebootLoop` flag verbatim, so the
//! decision is made here from the restart history kept next to the agent.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Start timestamps kept in the file; older ones are dropped.
const MAX_HISTORY: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Id the platform assigned at first registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// Every start ever recorded, including the first boot.
    #[serde(default)]
    pub total_starts: u32,
    /// Most recent start timestamps, oldest first.
    #[serde(default)]
    pub starts: Vec<DateTime<Utc>>,
}

impl AgentState {
    pub fn record_start(&mut self, at: DateTime<Utc>) {
        self.total_starts = self.total_starts.saturating_add(1);
        self.starts.push(at);
        if self.starts.len() > MAX_HISTORY {
            let excess = self.starts.len() - MAX_HISTORY;
            self.starts.drain(..excess);
        }
    }

    /// Restarts after the first boot.
    pub fn restart_count(&self) -> u32 {
        self.total_starts.saturating_sub(1)
    }

    pub fn last_start(&self) -> Option<DateTime<Utc>> {
        self.starts.last().copied()
    }
}

/// A reboot loop is `threshold` or more starts inside the trailing `window`.
pub fn in_reboot_loop(
    starts: &[DateTime<Utc>],
    now: DateTime<Utc>,
    threshold: u32,
    window: Duration,
) -> bool {
    if threshold == 0 {
        return false;
    }
    let since = now - window;
    let recent = starts.iter().filter(|at| **at >= since && **at <= now).count();
    recent >= threshold as usize
}

/// JSON file holding the [`AgentState`]; writes go through a temp file and rename.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files start a fresh history.
    pub fn load(&self) -> AgentState {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return AgentState::default();
            }
            Err(err) => {
                warn!(target: "fleet::agent", path = %self.path.display(), error = %err, "agent state unreadable; starting fresh");
                return AgentState::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(history) => history,
            Err(err) => {
                warn!(target: "fleet::agent", path = %self.path.display(), error = %err, "agent state corrupt; starting fresh");
                AgentState::default()
            }
        }
    }

    pub fn save(&self, state: &AgentState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(state).context("encode agent state")?;
        std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        debug!(target: "fleet::agent", path = %self.path.display(), starts = state.total_starts, "agent state saved");
        Ok(())
    }

    /// Load, append a start at `now`, persist, and return the updated history.
    pub fn record_start(&self, now: DateTime<Utc>) -> Result<AgentState> {
        let mut history = self.load();
        history.record_start(now);
        self.save(&history)?;
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp")
    }

    #[test]
    fn loop_needs_threshold_starts_inside_window() {
        let window = Duration::seconds(300);
        let starts = vec![at(0), at(100), at(200)];
        assert!(in_reboot_loop(&starts, at(250), 3, window));
        assert!(!in_reboot_loop(&starts, at(250), 4, window));
        // The first start has aged out of the window.
        assert!(!in_reboot_loop(&starts, at(350), 3, window));
    }

    #[test]
    fn zero_threshold_never_flags() {
        assert!(!in_reboot_loop(&[at(0)], at(1), 0, Duration::seconds(60)));
    }

    #[test]
    fn restart_count_excludes_first_boot() {
        let mut history = AgentState::default();
        assert_eq!(history.restart_count(), 0);
        history.record_start(at(0));
        assert_eq!(history.restart_count(), 0);
        history.record_start(at(10));
        history.record_start(at(20));
        assert_eq!(history.restart_count(), 2);
        assert_eq!(history.last_start(), Some(at(20)));
    }

    #[test]
    fn history_is_capped_but_total_keeps_counting() {
        let mut history = AgentState::default();
        for i in 0..(MAX_HISTORY as i64 + 10) {
            history.record_start(at(i));
        }
        assert_eq!(history.starts.len(), MAX_HISTORY);
        assert_eq!(history.starts[0], at(10));
        assert_eq!(history.total_starts as usize, MAX_HISTORY + 10);
    }

    #[test]
    fn file_survives_restarts_and_tolerates_garbage() {
        let dir = tempdir().expect("tempdir");
        let file = StateFile::new(dir.path().join("nested").join("agent-state.json"));
        assert_eq!(file.load(), AgentState::default());

        file.record_start(at(0)).expect("first start");
        let history = file.record_start(at(5)).expect("second start");
        assert_eq!(history.total_starts, 2);
        assert_eq!(file.load(), history);

        let mut with_id = history.clone();
        with_id.remote_id = Some("agent-7".into());
        file.save(&with_id).expect("save id");
        assert_eq!(file.load().remote_id.as_deref(), Some("agent-7"));

        std::fs::write(file.path(), b"not json").expect("corrupt");
        assert_eq!(file.load(), AgentState::default());
    }
}
