use std::sync::Arc;

use crate::console::ConsoleState;
use crate::persistence::RecoveryReport;
use crate::reconciler::SessionArtifacts;
use crate::supervisor::AgentSupervisor;

pub struct AppState {
    pub supervisor: Arc<AgentSupervisor>,
    pub console: Arc<ConsoleState>,
    pub artifacts: Arc<dyn SessionArtifacts>,
    /// Startup recovery report; fixed for the lifetime of the process
    pub recovery: RecoveryReport,
}
