//! Shared types between the agent supervisor and the console frontend
//!
//! These types are used by both:
//! - the supervisor (native Rust, tokio)
//! - the browser console (TypeScript, generated through ts-rs)
//!
//! Serializable with serde for JSON over HTTP

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Normalized Agent Events
// ============================================================================

/// Token accounting reported at the end of an agent step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "generated.ts")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_creation: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            ..Self::default()
        }
    }
}

/// StandardEvent - backend-independent output of an agent process
///
/// Every backend adapter maps its own JSON protocol onto these variants.
/// Downstream consumers receive each event both typed and narrated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(tag = "type", rename_all = "snake_case")]
#[ts(export, export_to = "generated.ts")]
pub enum StandardEvent {
    /// Backend announced (or resumed) a session
    Init { session_id: String, model: String },

    /// Assistant text, possibly a streaming delta
    Text { text: String, is_streaming: bool },

    /// Model reasoning, possibly a streaming delta
    Thinking { text: String, is_streaming: bool },

    /// Agent started a tool call
    ToolStart {
        tool_name: String,
        #[ts(type = "unknown")]
        tool_input: serde_json::Value,
    },

    /// Tool call returned
    ToolResult { tool_output: String },

    /// One agent turn finished
    StepComplete {
        tokens: TokenUsage,
        cost: Option<f64>,
        #[ts(type = "unknown")]
        model_usage: Option<serde_json::Value>,
    },

    /// Backend reported a protocol-level error; the process keeps running
    Error { message: String },

    /// Raw context window statistics
    ContextStats {
        #[ts(type = "unknown")]
        raw: serde_json::Value,
    },
}

impl StandardEvent {
    /// Short machine-readable name of the variant, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StandardEvent::Init { .. } => "init",
            StandardEvent::Text { .. } => "text",
            StandardEvent::Thinking { .. } => "thinking",
            StandardEvent::ToolStart { .. } => "tool_start",
            StandardEvent::ToolResult { .. } => "tool_result",
            StandardEvent::StepComplete { .. } => "step_complete",
            StandardEvent::Error { .. } => "error",
            StandardEvent::ContextStats { .. } => "context_stats",
        }
    }
}

// ============================================================================
// Run Requests
// ============================================================================

/// How much autonomy the agent CLI gets for file edits and commands.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "generated.ts")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    /// Value understood by `--permission-mode` style CLI flags.
    pub fn as_cli_value(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }
}

/// RunnerRequest - one invocation of an agent
///
/// Stored verbatim on the running process so an automatic restart can
/// replay it exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "generated.ts")]
pub struct RunnerRequest {
    pub agent_id: String,
    pub prompt: String,
    pub working_dir: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub force_new_session: bool,
    /// Backend-specific extras, passed through to the adapter untouched
    #[serde(default)]
    #[ts(type = "Record<string, unknown>")]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl RunnerRequest {
    pub fn new(
        agent_id: impl Into<String>,
        prompt: impl Into<String>,
        working_dir: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            session_id: None,
            model: None,
            permission_mode: PermissionMode::Default,
            system_prompt: None,
            force_new_session: false,
            extras: serde_json::Map::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Session to resume, unless the caller asked for a fresh conversation.
    pub fn resume_session(&self) -> Option<&str> {
        if self.force_new_session {
            None
        } else {
            self.session_id.as_deref()
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extras.get(key).and_then(|v| v.as_str())
    }
}

// ============================================================================
// Agent Status & Diagnostics
// ============================================================================

/// Caller-visible logical status of an agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "generated.ts")]
pub enum AgentStatus {
    Idle,
    Working,
    Waiting,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Waiting => "waiting",
            AgentStatus::Error => "error",
        };
        f.write_str(v)
    }
}

/// One process death, kept for diagnostics and restart-pattern analysis.
/// Never mutated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "generated.ts")]
pub struct ProcessDeathRecord {
    pub agent_id: String,
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub runtime_ms: u64,
    pub was_tracked: bool,
    pub timestamp: DateTime<Utc>,
    pub stderr_tail: String,
}

/// Read-only view of a running agent process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "generated.ts")]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub run_id: String,
    pub pid: u32,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub restart_count: u32,
    pub memory_mb: Option<f64>,
}

// ============================================================================
// Tests
// ============================================================================
