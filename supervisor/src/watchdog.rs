//! Liveness watchdog.
//!
//! Catches processes that died without their exit monitor noticing, e.g.
//! when the wait itself errored. Deaths found here go through the same
//! finalization as monitored exits.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::process::{self, ExitReport};
use crate::supervisor::AgentSupervisor;

/// Probe every tracked process once. Returns how many deaths were finalized.
pub fn sweep(supervisor: &Arc<AgentSupervisor>) -> usize {
    let mut finalized = 0;
    for live in supervisor.registry().live_processes() {
        if process::is_process_alive(live.pid) {
            continue;
        }
        warn!(
            agent_id = %live.agent_id,
            pid = live.pid,
            run_id = %live.run_id,
            "watchdog: tracked process is gone"
        );
        if supervisor.finalize(&live.agent_id, live.run_id, ExitReport::unknown(), "watchdog") {
            finalized += 1;
        }
    }
    finalized
}

/// Background task: sweep every `interval` until the runtime shuts down.
pub async fn run_watchdog(supervisor: Arc<AgentSupervisor>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let finalized = sweep(&supervisor);
        if finalized > 0 {
            debug!(finalized, "watchdog sweep finalized dead processes");
        }
    }
}
