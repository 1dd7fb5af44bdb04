//! ConsoleState - what the operator console shows about each agent.
//!
//! Implements the observer side: logical status and the most recent
//! narrated output per agent. It is also the status source the periodic
//! reconciler corrects.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Serialize;
use shared_types::{AgentStatus, RunnerRequest, StandardEvent};
use tracing::{debug, info, warn};

use crate::observer::SupervisorObserver;
use crate::persistence::RecoveryReport;
use crate::reconciler::{AgentStatusSource, TrackedAgent};

/// Lines of output kept per agent, as many as the console terminal buffers.
pub const OUTPUT_LINES_PER_AGENT: usize = 1000;

#[derive(Debug, Clone)]
struct AgentEntry {
    status: AgentStatus,
    working_dir: Option<String>,
    session_id: Option<String>,
    output: VecDeque<String>,
}

impl AgentEntry {
    fn new() -> Self {
        Self {
            status: AgentStatus::Idle,
            working_dir: None,
            session_id: None,
            output: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentStatusView {
    pub agent_id: String,
    pub status: AgentStatus,
    pub session_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConsoleState {
    agents: Mutex<HashMap<String, AgentEntry>>,
}

impl ConsoleState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AgentEntry>> {
        self.agents.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_entry<T>(&self, agent_id: &str, f: impl FnOnce(&mut AgentEntry) -> T) -> T {
        let mut agents = self.lock();
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(AgentEntry::new);
        f(entry)
    }

    /// Record a run the operator started.
    pub fn note_run(&self, request: &RunnerRequest) {
        self.with_entry(&request.agent_id, |entry| {
            entry.status = AgentStatus::Working;
            entry.working_dir = Some(request.working_dir.clone());
            if request.session_id.is_some() && !request.force_new_session {
                entry.session_id = request.session_id.clone();
            }
        });
    }

    /// Track the agents a previous supervisor run left behind as `working`,
    /// so the reconciler settles them from their transcripts.
    pub fn seed_recovered(&self, report: &RecoveryReport) {
        for entry in report.alive.iter().chain(&report.dead) {
            self.with_entry(&entry.agent_id, |agent| {
                agent.status = AgentStatus::Working;
                agent.working_dir = Some(entry.last_request.working_dir.clone());
                agent.session_id = entry
                    .session_id
                    .clone()
                    .or_else(|| entry.last_request.session_id.clone());
            });
        }
    }

    pub fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.lock().get(agent_id).map(|e| e.status)
    }

    pub fn statuses(&self) -> Vec<AgentStatusView> {
        let mut views: Vec<AgentStatusView> = self
            .lock()
            .iter()
            .map(|(agent_id, entry)| AgentStatusView {
                agent_id: agent_id.clone(),
                status: entry.status,
                session_id: entry.session_id.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        views
    }

    pub fn tracked_agent(&self, agent_id: &str) -> Option<TrackedAgent> {
        self.lock().get(agent_id).map(|entry| TrackedAgent {
            agent_id: agent_id.to_string(),
            status: entry.status,
            working_dir: entry.working_dir.clone(),
            session_id: entry.session_id.clone(),
        })
    }

    pub fn set_status_now(&self, agent_id: &str, status: AgentStatus) {
        self.with_entry(agent_id, |entry| entry.status = status);
    }

    /// The last `lines` output lines, oldest first.
    pub fn recent_output(&self, agent_id: &str, lines: usize) -> Vec<String> {
        self.lock()
            .get(agent_id)
            .map(|entry| {
                let skip = entry.output.len().saturating_sub(lines);
                entry.output.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    fn push_output(&self, agent_id: &str, line: String) {
        self.with_entry(agent_id, |entry| {
            if entry.output.len() == OUTPUT_LINES_PER_AGENT {
                entry.output.pop_front();
            }
            entry.output.push_back(line);
        });
    }
}

impl SupervisorObserver for ConsoleState {
    fn on_event(&self, agent_id: &str, event: &StandardEvent) {
        debug!(agent_id, kind = event.kind(), "agent event");
        let status = match event {
            // The turn is over; the process waits for the next message.
            StandardEvent::StepComplete { .. } => AgentStatus::Waiting,
            _ => AgentStatus::Working,
        };
        self.set_status_now(agent_id, status);
    }

    fn on_output(&self, agent_id: &str, text: &str, is_streaming: bool) {
        if !is_streaming {
            debug!(agent_id, "{text}");
        }
        self.push_output(agent_id, text.to_string());
    }

    fn on_session_id(&self, agent_id: &str, session_id: &str) {
        info!(agent_id, session_id, "agent session");
        self.with_entry(agent_id, |entry| entry.session_id = Some(session_id.to_string()));
    }

    fn on_complete(&self, agent_id: &str, success: bool) {
        info!(agent_id, success, "agent run complete");
        self.set_status_now(agent_id, AgentStatus::Idle);
    }

    fn on_error(&self, agent_id: &str, message: &str) {
        warn!(agent_id, "agent error: {message}");
        self.set_status_now(agent_id, AgentStatus::Error);
        self.push_output(agent_id, format!("Error: {message}"));
    }
}

#[async_trait]
impl AgentStatusSource for ConsoleState {
    async fn tracked_agents(&self) -> Vec<TrackedAgent> {
        let mut agents: Vec<TrackedAgent> = self
            .lock()
            .iter()
            .map(|(agent_id, entry)| TrackedAgent {
                agent_id: agent_id.clone(),
                status: entry.status,
                working_dir: entry.working_dir.clone(),
                session_id: entry.session_id.clone(),
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    async fn set_status(&self, agent_id: &str, status: AgentStatus) {
        self.set_status_now(agent_id, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::PersistedProcess;
    use chrono::Utc;
    use shared_types::TokenUsage;

    #[test]
    fn status_follows_the_run_lifecycle() {
        let console = ConsoleState::new();
        console.note_run(&RunnerRequest::new("a1", "hi", "/w"));
        assert_eq!(console.status("a1"), Some(AgentStatus::Working));

        console.on_event(
            "a1",
            &StandardEvent::StepComplete {
                tokens: TokenUsage::new(1, 1),
                cost: None,
                model_usage: None,
            },
        );
        assert_eq!(console.status("a1"), Some(AgentStatus::Waiting));

        console.on_complete("a1", true);
        assert_eq!(console.status("a1"), Some(AgentStatus::Idle));

        console.on_error("a1", "boom");
        assert_eq!(console.status("a1"), Some(AgentStatus::Error));
    }

    #[test]
    fn output_is_bounded_and_ordered() {
        let console = ConsoleState::new();
        for i in 0..(OUTPUT_LINES_PER_AGENT + 5) {
            console.on_output("a1", &format!("line {i}"), false);
        }
        let all = console.recent_output("a1", usize::MAX);
        assert_eq!(all.len(), OUTPUT_LINES_PER_AGENT);
        assert_eq!(all[0], "line 5");
        assert_eq!(console.recent_output("a1", 2), vec!["line 1003", "line 1004"]);
        assert!(console.recent_output("nobody", 10).is_empty());
    }

    #[tokio::test]
    async fn recovered_agents_are_tracked_for_reconciliation() {
        let console = ConsoleState::new();
        let persisted = |agent_id: &str, session_id: Option<&str>| PersistedProcess {
            agent_id: agent_id.to_string(),
            pid: 9_999_999,
            session_id: session_id.map(str::to_string),
            started_at: Utc::now(),
            last_request: RunnerRequest::new(agent_id, "hi", "/work/repo").with_session("s0"),
        };
        console.seed_recovered(&RecoveryReport {
            alive: vec![persisted("a1", Some("s1"))],
            dead: vec![persisted("a2", None)],
        });

        let agents = console.tracked_agents().await;
        assert_eq!(agents.len(), 2);
        assert!(agents.iter().all(|a| a.status == AgentStatus::Working));
        assert!(agents.iter().all(|a| a.working_dir.as_deref() == Some("/work/repo")));
        assert_eq!(agents[0].session_id.as_deref(), Some("s1"));
        assert_eq!(agents[1].session_id.as_deref(), Some("s0"));
    }

    #[tokio::test]
    async fn status_source_reports_session_and_working_dir() {
        let console = ConsoleState::new();
        console.note_run(&RunnerRequest::new("a1", "hi", "/w"));
        console.on_session_id("a1", "s1");

        let agents = console.tracked_agents().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].session_id.as_deref(), Some("s1"));
        assert_eq!(agents[0].working_dir.as_deref(), Some("/w"));

        console.set_status("a1", AgentStatus::Idle).await;
        assert_eq!(console.status("a1"), Some(AgentStatus::Idle));
    }
}
