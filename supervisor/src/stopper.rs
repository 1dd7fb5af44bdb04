//! Signal-escalation stopper.
//!
//! SIGINT first, SIGTERM after `term_after`, SIGKILL at `kill_after`, both
//! measured from the moment the stop began. Every step after the first is
//! skipped once the process is gone.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::process;

/// Where escalation signals go. The OS implementation signals the process
/// group and the process itself.
pub trait ProcessSignaller: Send + Sync + 'static {
    fn signal(&self, pid: u32, sig: Signal);
    fn is_alive(&self, pid: u32) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsSignaller;

impl ProcessSignaller for OsSignaller {
    fn signal(&self, pid: u32, sig: Signal) {
        process::signal_group(pid, sig);
        process::send_signal(pid, sig);
    }

    fn is_alive(&self, pid: u32) -> bool {
        process::is_process_alive(pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationSchedule {
    pub term_after: Duration,
    pub kill_after: Duration,
}

impl EscalationSchedule {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            term_after: config.stop_term_after,
            kill_after: config.stop_kill_after,
        }
    }
}

impl Default for EscalationSchedule {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

/// Interrupt `pid` now and escalate in the background.
///
/// Never blocks. The returned handle resolves once the process is gone or
/// SIGKILL has been sent.
pub fn escalate<S: ProcessSignaller>(
    signaller: Arc<S>,
    agent_id: &str,
    pid: u32,
    schedule: EscalationSchedule,
) -> JoinHandle<()> {
    let agent_id = agent_id.to_string();
    signaller.signal(pid, Signal::SIGINT);
    debug!(agent_id = %agent_id, pid, "stop: SIGINT sent");

    tokio::spawn(async move {
        tokio::time::sleep(schedule.term_after).await;
        if !signaller.is_alive(pid) {
            debug!(agent_id = %agent_id, pid, "stop: exited after SIGINT");
            return;
        }
        info!(agent_id = %agent_id, pid, "stop: still alive, sending SIGTERM");
        signaller.signal(pid, Signal::SIGTERM);

        tokio::time::sleep(schedule.kill_after.saturating_sub(schedule.term_after)).await;
        if !signaller.is_alive(pid) {
            debug!(agent_id = %agent_id, pid, "stop: exited after SIGTERM");
            return;
        }
        warn!(agent_id = %agent_id, pid, "stop: still alive, sending SIGKILL");
        signaller.signal(pid, Signal::SIGKILL);
    })
}
