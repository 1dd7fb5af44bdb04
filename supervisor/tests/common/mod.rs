//! Shared helpers: `/bin/sh` backed agents and notice collection.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use shared_types::RunnerRequest;
use supervisor::adapters::generic::GenericJsonAdapter;
use supervisor::config::SupervisorConfig;
use supervisor::observer::{ChannelObserver, SupervisorNotice};
use supervisor::AgentSupervisor;
use tokio::sync::mpsc::UnboundedReceiver;

/// Adapter that runs `script` with `sh -c`. `$0` is `agent`; request
/// arguments follow as `$1..`.
pub fn sh_adapter(script: &str) -> GenericJsonAdapter {
    GenericJsonAdapter::new(
        "/bin/sh",
        vec!["-c".to_string(), script.to_string(), "agent".to_string()],
    )
}

/// Short timings so crash and restart scenarios finish quickly.
pub fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        stop_term_after: Duration::from_millis(100),
        stop_kill_after: Duration::from_millis(300),
        restart_delay: Duration::from_millis(50),
        ..SupervisorConfig::default()
    }
}

pub fn supervisor_with(
    adapter: GenericJsonAdapter,
    config: SupervisorConfig,
) -> (Arc<AgentSupervisor>, UnboundedReceiver<SupervisorNotice>) {
    let (observer, rx) = ChannelObserver::new();
    let sup = AgentSupervisor::new(Arc::new(adapter), Arc::new(observer), config);
    (sup, rx)
}

pub fn request(agent_id: &str, prompt: &str) -> RunnerRequest {
    RunnerRequest::new(
        agent_id,
        prompt,
        std::env::temp_dir().to_string_lossy().to_string(),
    )
}

/// Collect notices up to and including the first one matching `done`.
/// Panics if that does not happen within `timeout`.
pub async fn collect_until(
    rx: &mut UnboundedReceiver<SupervisorNotice>,
    timeout: Duration,
    done: impl Fn(&SupervisorNotice) -> bool,
) -> Vec<SupervisorNotice> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(timeout, async {
        while let Some(notice) = rx.recv().await {
            let finished = done(&notice);
            seen.push(notice);
            if finished {
                return true;
            }
        }
        false
    })
    .await;
    match result {
        Ok(true) => seen,
        _ => panic!("condition not met within {timeout:?}; saw {seen:#?}"),
    }
}

/// Notices that arrive within `window`.
pub async fn drain_for(
    rx: &mut UnboundedReceiver<SupervisorNotice>,
    window: Duration,
) -> Vec<SupervisorNotice> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(window, async {
        while let Some(notice) = rx.recv().await {
            seen.push(notice);
        }
    })
    .await;
    seen
}

pub fn is_complete(notice: &SupervisorNotice, agent: &str) -> bool {
    matches!(notice, SupervisorNotice::Complete { .. }) && notice.agent_id() == agent
}

pub fn output_text(notice: &SupervisorNotice) -> Option<&str> {
    match notice {
        SupervisorNotice::Output { text, .. } => Some(text),
        _ => None,
    }
}
