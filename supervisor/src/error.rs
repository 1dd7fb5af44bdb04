//! Error taxonomy for the agent supervisor.
//!
//! Only failures the caller must act on are errors. A non-JSON stdout line is
//! passed through as raw output, and signalling an already-dead process is an
//! expected race, so neither has a variant here.

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {executable} for agent {agent_id}: {reason}")]
    Spawn {
        agent_id: String,
        executable: String,
        reason: String,
    },

    #[error("Agent {agent_id} exited unexpectedly ({detail})")]
    UnexpectedExit { agent_id: String, detail: String },

    #[error("Agent {agent_id} died after {runtime_ms}ms: configuration or startup failure")]
    ConfigurationFailure { agent_id: String, runtime_ms: u64 },

    #[error("Agent {agent_id} exhausted its restart budget ({restarts} restarts)")]
    RestartBudgetExhausted { agent_id: String, restarts: u32 },

    #[error("No running process for agent {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
