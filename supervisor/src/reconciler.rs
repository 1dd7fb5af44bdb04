//! Status reconciler.
//!
//! Corrects the caller-visible status of agents the supervisor is not
//! tracking, using the freshness of their on-disk session transcript. It
//! never spawns or kills anything.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use shared_types::AgentStatus;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

use crate::supervisor::AgentSupervisor;

/// Bytes read from the end of a transcript to find its last entry.
const TRANSCRIPT_TAIL_BYTES: u64 = 64 * 1024;

/// What a session artifact says about recent work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactActivity {
    pub modified_at: SystemTime,
    /// The transcript does not end with a completed assistant turn.
    pub unfinished: bool,
}

#[async_trait]
pub trait SessionArtifacts: Send + Sync {
    async fn activity(&self, working_dir: &str, session_id: &str) -> Option<ArtifactActivity>;
}

/// An agent as the status owner sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedAgent {
    pub agent_id: String,
    pub status: AgentStatus,
    pub working_dir: Option<String>,
    pub session_id: Option<String>,
}

/// Owner of the logical statuses being reconciled.
#[async_trait]
pub trait AgentStatusSource: Send + Sync {
    async fn tracked_agents(&self) -> Vec<TrackedAgent>;
    async fn set_status(&self, agent_id: &str, status: AgentStatus);
}

/// Decide the corrected status.
///
/// While the registry tracks a process its status is trusted. Otherwise a
/// `working` agent with no fresh activity becomes `idle`, and an `idle`
/// agent with fresh unfinished activity becomes `working`.
pub fn reconcile_status(
    status: AgentStatus,
    tracked: bool,
    activity: Option<ArtifactActivity>,
    now: SystemTime,
    freshness: Duration,
) -> AgentStatus {
    if tracked {
        return status;
    }
    let fresh = activity.filter(|a| {
        now.duration_since(a.modified_at)
            .map(|age| age <= freshness)
            .unwrap_or(true)
    });
    match (status, fresh) {
        (AgentStatus::Working, None) => AgentStatus::Idle,
        (AgentStatus::Idle, Some(a)) if a.unfinished => AgentStatus::Working,
        _ => status,
    }
}

/// Reconcile one agent on demand.
pub async fn reconcile_agent(
    supervisor: &AgentSupervisor,
    artifacts: &dyn SessionArtifacts,
    agent: &TrackedAgent,
) -> AgentStatus {
    let tracked = supervisor.is_running(&agent.agent_id);
    let activity = match (&agent.working_dir, &agent.session_id, tracked) {
        (Some(dir), Some(session), false) => artifacts.activity(dir, session).await,
        _ => None,
    };
    reconcile_status(
        agent.status,
        tracked,
        activity,
        SystemTime::now(),
        supervisor.config().artifact_freshness,
    )
}

/// Reconcile every agent the source knows. Returns how many changed.
pub async fn reconcile_all(
    supervisor: &AgentSupervisor,
    artifacts: &dyn SessionArtifacts,
    source: &dyn AgentStatusSource,
) -> usize {
    let mut changed = 0;
    for agent in source.tracked_agents().await {
        let status = reconcile_agent(supervisor, artifacts, &agent).await;
        if status != agent.status {
            info!(
                agent_id = %agent.agent_id,
                from = %agent.status,
                to = %status,
                "reconciled agent status"
            );
            source.set_status(&agent.agent_id, status).await;
            changed += 1;
        }
    }
    changed
}

pub async fn run_reconciler(
    supervisor: Arc<AgentSupervisor>,
    artifacts: Arc<dyn SessionArtifacts>,
    source: Arc<dyn AgentStatusSource>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let changed = reconcile_all(&supervisor, artifacts.as_ref(), source.as_ref()).await;
        debug!(changed, "status reconciliation pass");
    }
}

/// Claude Code style JSONL transcripts:
/// `<root>/<encoded working dir>/<session id>.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlSessionArtifacts {
    root: PathBuf,
}

impl JsonlSessionArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn transcript_path(&self, working_dir: &str, session_id: &str) -> PathBuf {
        self.root
            .join(encode_working_dir(working_dir))
            .join(format!("{session_id}.jsonl"))
    }
}

/// `/home/me/my.proj` -> `-home-me-my-proj`
pub fn encode_working_dir(working_dir: &str) -> String {
    working_dir
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Whether a transcript entry closes an assistant turn.
fn is_completed_assistant_turn(entry: &Value) -> bool {
    if entry["type"] != "assistant" {
        return false;
    }
    match entry["message"]["stop_reason"].as_str() {
        Some("tool_use") => false,
        Some(_) => true,
        None => false,
    }
}

async fn last_entry(path: &Path) -> std::io::Result<Option<Value>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(TRANSCRIPT_TAIL_BYTES);
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail).await?;

    let text = String::from_utf8_lossy(&tail);
    Ok(text
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .find_map(|l| serde_json::from_str::<Value>(l).ok()))
}

#[async_trait]
impl SessionArtifacts for JsonlSessionArtifacts {
    async fn activity(&self, working_dir: &str, session_id: &str) -> Option<ArtifactActivity> {
        let path = self.transcript_path(working_dir, session_id);
        let modified_at = tokio::fs::metadata(&path).await.ok()?.modified().ok()?;
        let unfinished = match last_entry(&path).await {
            Ok(Some(entry)) => !is_completed_assistant_turn(&entry),
            Ok(None) => false,
            Err(e) => {
                debug!(path = %path.display(), "failed to read transcript: {e}");
                false
            }
        };
        Some(ArtifactActivity {
            modified_at,
            unfinished,
        })
    }
}
