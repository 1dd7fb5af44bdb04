//! Process handle registry - the authoritative `agent_id -> process` map.
//!
//! The map sits behind a synchronous mutex that is never held across an
//! `.await`. Removal goes through [`ProcessRegistry::take_if_run`], which is
//! the single check-and-remove that makes finalization exactly-once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use shared_types::{AgentSnapshot, RunnerRequest};
use tokio::sync::mpsc;
use ulid::Ulid;

use crate::process::StderrTail;

/// One running agent process.
///
/// The `Child` itself is owned by the monitor task; the handle keeps the
/// pieces other operations need.
#[derive(Debug)]
pub struct AgentProcessHandle {
    pub agent_id: String,
    /// Unique per spawn. Exit detection only removes the handle whose run id
    /// it observed.
    pub run_id: Ulid,
    /// Also the process group id: every agent leads its own group.
    pub pid: u32,
    pub session_id: Option<String>,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
    pub last_request: RunnerRequest,
    pub restart_count: u32,
    pub last_restart_time: Option<Instant>,
    pub stdin_tx: mpsc::UnboundedSender<String>,
    pub stderr_tail: Arc<Mutex<StderrTail>>,
    /// Set once the exit monitor has reaped the process and is finalizing.
    pub exiting: bool,
}

impl AgentProcessHandle {
    pub fn snapshot(&self, memory_mb: Option<f64>) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent_id.clone(),
            run_id: self.run_id.to_string(),
            pid: self.pid,
            session_id: self.session_id.clone(),
            started_at: self.started_at,
            uptime_secs: self.start_time.elapsed().as_secs(),
            restart_count: self.restart_count,
            memory_mb,
        }
    }

    pub fn stderr_contents(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail.contents())
            .unwrap_or_default()
    }
}

/// Identity of a live process, detached from the registry lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveProcess {
    pub agent_id: String,
    pub run_id: Ulid,
    pub pid: u32,
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    handles: Mutex<HashMap<String, AgentProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AgentProcessHandle>> {
        // Entries are only ever replaced whole, so poisoning is ignored.
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a handle, returning whatever was registered for the agent before.
    pub fn insert(&self, handle: AgentProcessHandle) -> Option<AgentProcessHandle> {
        self.lock().insert(handle.agent_id.clone(), handle)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.lock().contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn pid_of(&self, agent_id: &str) -> Option<u32> {
        self.lock().get(agent_id).map(|h| h.pid)
    }

    pub fn stdin_of(&self, agent_id: &str) -> Option<mpsc::UnboundedSender<String>> {
        self.lock().get(agent_id).map(|h| h.stdin_tx.clone())
    }

    /// Record a session id for the given run. Returns `true` only when the
    /// stored value actually changed.
    pub fn update_session(&self, agent_id: &str, run_id: Ulid, session_id: &str) -> bool {
        let mut handles = self.lock();
        match handles.get_mut(agent_id) {
            Some(handle) if handle.run_id == run_id => {
                if handle.session_id.as_deref() == Some(session_id) {
                    return false;
                }
                handle.session_id = Some(session_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Flag a reaped process so liveness sweeps leave it to its monitor.
    pub fn mark_exiting(&self, agent_id: &str, run_id: Ulid) {
        if let Some(handle) = self.lock().get_mut(agent_id) {
            if handle.run_id == run_id {
                handle.exiting = true;
            }
        }
    }

    /// Remove the agent's handle regardless of which run it belongs to.
    pub fn take(&self, agent_id: &str) -> Option<AgentProcessHandle> {
        self.lock().remove(agent_id)
    }

    /// Remove the agent's handle only if it still belongs to `run_id`.
    ///
    /// Of several concurrent detectors of the same death, exactly one gets
    /// `Some`.
    pub fn take_if_run(&self, agent_id: &str, run_id: Ulid) -> Option<AgentProcessHandle> {
        let mut handles = self.lock();
        if handles.get(agent_id).is_some_and(|h| h.run_id == run_id) {
            handles.remove(agent_id)
        } else {
            None
        }
    }

    /// Processes the watchdog should probe.
    pub fn live_processes(&self) -> Vec<LiveProcess> {
        self.lock()
            .values()
            .filter(|h| !h.exiting)
            .map(|h| LiveProcess {
                agent_id: h.agent_id.clone(),
                run_id: h.run_id,
                pid: h.pid,
            })
            .collect()
    }

    /// Apply `f` to every handle under one lock acquisition.
    pub fn map_handles<T>(&self, f: impl Fn(&AgentProcessHandle) -> T) -> Vec<T> {
        self.lock().values().map(f).collect()
    }
}
