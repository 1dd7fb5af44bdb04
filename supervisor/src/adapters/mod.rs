//! Built-in backend adapters.
//!
//! - [`claude::ClaudeCodeAdapter`]: Claude Code in `--output-format stream-json` mode
//! - [`generic::GenericJsonAdapter`]: any CLI speaking a flat `type`-tagged NDJSON schema

pub mod claude;
pub mod generic;

use std::sync::Arc;

use crate::adapter::BackendAdapter;
use crate::config::{BackendKind, Config};

/// Build the adapter selected by configuration.
pub fn create_adapter(config: &Config) -> Arc<dyn BackendAdapter> {
    match config.backend {
        BackendKind::Claude => Arc::new(claude::ClaudeCodeAdapter::new(&config.agent_binary)),
        BackendKind::Generic => Arc::new(generic::GenericJsonAdapter::new(
            &config.agent_binary,
            config.agent_args.clone(),
        )),
    }
}
