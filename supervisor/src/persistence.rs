//! Persistence sidecar for live process metadata.
//!
//! The state file is a JSON array rewritten atomically (temp file, then
//! rename). It is read once at startup to report which agents from the
//! previous supervisor run are still alive. Their pipes died with that run,
//! so the report is diagnostic only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::RunnerRequest;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SupervisorError};
use crate::process;
use crate::registry::ProcessRegistry;
use crate::supervisor::AgentSupervisor;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedProcess {
    pub agent_id: String,
    pub pid: u32,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_request: RunnerRequest,
}

/// Which previously recorded processes survived the supervisor restart.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RecoveryReport {
    pub alive: Vec<PersistedProcess>,
    pub dead: Vec<PersistedProcess>,
}

pub fn collect(registry: &ProcessRegistry) -> Vec<PersistedProcess> {
    let mut processes = registry.map_handles(|h| PersistedProcess {
        agent_id: h.agent_id.clone(),
        pid: h.pid,
        session_id: h.session_id.clone(),
        started_at: h.started_at,
        last_request: h.last_request.clone(),
    });
    processes.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    processes
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace the state file.
pub async fn save(path: &Path, processes: &[PersistedProcess]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(processes)?;
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        SupervisorError::Persistence(format!(
            "failed to move {} into place: {e}",
            tmp.display()
        ))
    })?;
    debug!(path = %path.display(), count = processes.len(), "persisted live processes");
    Ok(())
}

/// Read the state file. A missing file means nothing was running.
pub async fn load(path: &Path) -> Result<Vec<PersistedProcess>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Load the previous run's state and probe each recorded pid.
///
/// An unreadable state file yields an empty report; it never blocks startup.
pub async fn recover(path: &Path) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let entries = match load(path).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), "ignoring unreadable process state file: {e}");
            return report;
        }
    };
    for entry in entries {
        if process::is_process_alive(entry.pid) {
            warn!(
                agent_id = %entry.agent_id,
                pid = entry.pid,
                session_id = ?entry.session_id,
                "agent process from previous supervisor run is still alive; it cannot be reattached"
            );
            report.alive.push(entry);
        } else {
            debug!(agent_id = %entry.agent_id, pid = entry.pid, "recorded agent process is gone");
            report.dead.push(entry);
        }
    }
    info!(
        alive = report.alive.len(),
        dead = report.dead.len(),
        "recovered process state"
    );
    report
}

pub async fn persist_now(supervisor: &AgentSupervisor, path: &Path) -> Result<()> {
    save(path, &collect(supervisor.registry())).await
}

/// Background task: persist every `interval`.
pub async fn run_persistence_loop(
    supervisor: Arc<AgentSupervisor>,
    path: PathBuf,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = persist_now(&supervisor, &path).await {
            error!(path = %path.display(), "failed to persist process state: {e}");
        }
    }
}
