use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared_types::{PermissionMode, RunnerRequest};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::{error::SupervisorError, reconciler, AppState};

const DEFAULT_OUTPUT_LINES: usize = 100;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/statuses", get(list_statuses))
        .route("/agents/{agent_id}/run", post(run_agent))
        .route("/agents/{agent_id}/message", post(send_message))
        .route("/agents/{agent_id}/interrupt", post(interrupt_agent))
        .route("/agents/{agent_id}/stop", post(stop_agent))
        .route("/agents/{agent_id}/output", get(agent_output))
        .route("/agents/{agent_id}/reconcile", post(reconcile_agent))
        .route("/crashes", get(list_crashes))
        .route("/recovery", get(recovery_report))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: &SupervisorError) -> Response {
    let status = match e {
        SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

/// GET /agents - live processes with memory usage
pub async fn list_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.snapshots().await)
}

/// GET /agents/statuses - logical statuses as the console sees them
pub async fn list_statuses(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.console.statuses())
}

/// Body of a run request; the agent id comes from the path.
#[derive(Debug, serde::Deserialize)]
pub struct RunBody {
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
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

impl RunBody {
    fn into_request(self, agent_id: String) -> RunnerRequest {
        RunnerRequest {
            agent_id,
            prompt: self.prompt,
            working_dir: self.working_dir,
            session_id: self.session_id,
            model: self.model,
            permission_mode: self.permission_mode,
            system_prompt: self.system_prompt,
            force_new_session: self.force_new_session,
            extras: self.extras,
        }
    }
}

/// POST /agents/{agent_id}/run
pub async fn run_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<RunBody>,
) -> impl IntoResponse {
    let request = body.into_request(agent_id.clone());
    state.console.note_run(&request);
    match state.supervisor.run(request).await {
        Ok(run_id) => Json(serde_json::json!({
            "agent_id": agent_id,
            "run_id": run_id.to_string(),
        }))
        .into_response(),
        Err(e) => {
            error!(agent_id = %agent_id, "run agent: {e}");
            error_response(&e)
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct MessageBody {
    pub text: String,
}

/// POST /agents/{agent_id}/message
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<MessageBody>,
) -> impl IntoResponse {
    let accepted = state.supervisor.send_message(&agent_id, &body.text);
    Json(serde_json::json!({ "accepted": accepted }))
}

/// POST /agents/{agent_id}/interrupt
pub async fn interrupt_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    if state.supervisor.interrupt(&agent_id) {
        StatusCode::OK.into_response()
    } else {
        error_response(&SupervisorError::NotFound(agent_id))
    }
}

/// POST /agents/{agent_id}/stop
pub async fn stop_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.stop(&agent_id) {
        Some(_escalation) => Json(serde_json::json!({ "status": "stopping" })).into_response(),
        None => error_response(&SupervisorError::NotFound(agent_id)),
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct OutputQuery {
    pub lines: Option<usize>,
}

/// GET /agents/{agent_id}/output?lines=N
pub async fn agent_output(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> impl IntoResponse {
    let lines = query.lines.unwrap_or(DEFAULT_OUTPUT_LINES);
    Json(state.console.recent_output(&agent_id, lines))
}

/// POST /agents/{agent_id}/reconcile - on-demand status reconciliation
pub async fn reconcile_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    let Some(agent) = state.console.tracked_agent(&agent_id) else {
        return (StatusCode::NOT_FOUND, format!("Unknown agent {agent_id}")).into_response();
    };
    let status =
        reconciler::reconcile_agent(&state.supervisor, state.artifacts.as_ref(), &agent).await;
    if status != agent.status {
        state.console.set_status_now(&agent_id, status);
    }
    Json(serde_json::json!({
        "agent_id": agent_id,
        "previous": agent.status,
        "status": status,
    }))
    .into_response()
}

/// GET /crashes - recent unexpected deaths, oldest first
pub async fn list_crashes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.crash_history())
}

/// GET /recovery - processes left over from the previous supervisor run
pub async fn recovery_report(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recovery.clone())
}
