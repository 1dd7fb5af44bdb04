//! Caller-facing notification interface.
//!
//! The supervisor reports everything through a [`SupervisorObserver`]. Calls
//! for one agent arrive in stdout order; the session id for a line is always
//! reported before that line's event.

use shared_types::StandardEvent;
use tokio::sync::mpsc;

pub trait SupervisorObserver: Send + Sync {
    fn on_event(&self, agent_id: &str, event: &StandardEvent);
    fn on_output(&self, agent_id: &str, text: &str, is_streaming: bool);
    fn on_session_id(&self, agent_id: &str, session_id: &str);
    fn on_complete(&self, agent_id: &str, success: bool);
    fn on_error(&self, agent_id: &str, message: &str);
}

/// One observer callback, as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorNotice {
    Event {
        agent_id: String,
        event: StandardEvent,
    },
    Output {
        agent_id: String,
        text: String,
        is_streaming: bool,
    },
    SessionId {
        agent_id: String,
        session_id: String,
    },
    Complete {
        agent_id: String,
        success: bool,
    },
    Error {
        agent_id: String,
        message: String,
    },
}

impl SupervisorNotice {
    pub fn agent_id(&self) -> &str {
        match self {
            SupervisorNotice::Event { agent_id, .. }
            | SupervisorNotice::Output { agent_id, .. }
            | SupervisorNotice::SessionId { agent_id, .. }
            | SupervisorNotice::Complete { agent_id, .. }
            | SupervisorNotice::Error { agent_id, .. } => agent_id,
        }
    }
}

/// Observer that forwards every callback into an unbounded channel.
///
/// Sends never block; notices are dropped only once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SupervisorNotice>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SupervisorNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, notice: SupervisorNotice) {
        let _ = self.tx.send(notice);
    }
}

impl SupervisorObserver for ChannelObserver {
    fn on_event(&self, agent_id: &str, event: &StandardEvent) {
        self.send(SupervisorNotice::Event {
            agent_id: agent_id.to_string(),
            event: event.clone(),
        });
    }

    fn on_output(&self, agent_id: &str, text: &str, is_streaming: bool) {
        self.send(SupervisorNotice::Output {
            agent_id: agent_id.to_string(),
            text: text.to_string(),
            is_streaming,
        });
    }

    fn on_session_id(&self, agent_id: &str, session_id: &str) {
        self.send(SupervisorNotice::SessionId {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
        });
    }

    fn on_complete(&self, agent_id: &str, success: bool) {
        self.send(SupervisorNotice::Complete {
            agent_id: agent_id.to_string(),
            success,
        });
    }

    fn on_error(&self, agent_id: &str, message: &str) {
        self.send(SupervisorNotice::Error {
            agent_id: agent_id.to_string(),
            message: message.to_string(),
        });
    }
}
