//! BackendAdapter - the seam between the supervisor and one agent CLI
//!
//! The supervisor never looks inside a backend's JSON protocol. An adapter
//! builds the command line for a request and maps each parsed stdout object
//! onto a [`StandardEvent`].

use std::path::PathBuf;

use shared_types::{RunnerRequest, StandardEvent};

pub trait BackendAdapter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Executable to spawn.
    fn executable_path(&self) -> PathBuf;

    /// Argument vector for one request. Session resume must be left out when
    /// the request sets `force_new_session`.
    fn build_args(&self, request: &RunnerRequest) -> Vec<String>;

    /// Whether the prompt is delivered over stdin instead of argv.
    fn requires_stdin_input(&self) -> bool {
        false
    }

    /// Frame one message for the process's stdin. Must end with a newline.
    fn format_stdin_input(&self, text: &str) -> String {
        format!("{text}\n")
    }

    /// Session id carried by a raw event, if any. Called for every parsed
    /// object, including ones `parse_event` ignores.
    fn extract_session_id(&self, raw: &serde_json::Value) -> Option<String>;

    /// Map a raw event. `None` means recognized but not user-visible.
    fn parse_event(&self, raw: &serde_json::Value) -> Option<StandardEvent>;
}
