//! AgentSupervisor - spawns agent processes, streams their output and
//! finalizes every death exactly once.
//!
//! Each spawned process gets four tasks: a stdout reader that decodes and
//! normalizes lines, a stderr reader that fills the tail buffer, a stdin
//! writer, and a monitor that owns the `Child` and waits for its exit.
//! Finalization removes the handle with `take_if_run`, so whichever of the
//! monitor and the watchdog gets there first does the work.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use shared_types::{AgentSnapshot, ProcessDeathRecord, RunnerRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::adapter::BackendAdapter;
use crate::config::SupervisorConfig;
use crate::crash::{CrashRecorder, DeathClass};
use crate::decoder::LineDecoder;
use crate::error::{Result, SupervisorError};
use crate::observer::SupervisorObserver;
use crate::process::{self, ExitReport, StderrTail};
use crate::protocol::{self, ParsedLine};
use crate::registry::{AgentProcessHandle, ProcessRegistry};
use crate::restart::{RestartDecision, RestartPolicy};
use crate::stopper::{self, EscalationSchedule, OsSignaller};

/// How long the monitor waits for stdout to drain after the process exits.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_BUFFER_BYTES: usize = 8192;

/// What the per-process tasks know about the run they serve.
#[derive(Debug, Clone)]
struct RunContext {
    agent_id: String,
    run_id: Ulid,
    pid: u32,
    start_time: Instant,
    stderr_tail: Arc<Mutex<StderrTail>>,
}

/// An automatic restart waiting out its delay.
#[derive(Debug)]
struct PendingRestart {
    token: Ulid,
    task: AbortHandle,
}

pub struct AgentSupervisor {
    adapter: Arc<dyn BackendAdapter>,
    observer: Arc<dyn SupervisorObserver>,
    config: SupervisorConfig,
    registry: ProcessRegistry,
    crashes: CrashRecorder,
    policy: RestartPolicy,
    signaller: Arc<OsSignaller>,
    /// Runs whose handle was removed by `stop()` and whose exit has not been
    /// observed yet.
    stopped_runs: Mutex<HashSet<Ulid>>,
    pending_restarts: Mutex<HashMap<String, PendingRestart>>,
}

impl AgentSupervisor {
    pub fn new(
        adapter: Arc<dyn BackendAdapter>,
        observer: Arc<dyn SupervisorObserver>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            crashes: CrashRecorder::new(&config),
            policy: RestartPolicy::from_config(&config),
            adapter,
            observer,
            config,
            registry: ProcessRegistry::new(),
            signaller: Arc::new(OsSignaller),
            stopped_runs: Mutex::new(HashSet::new()),
            pending_restarts: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn adapter(&self) -> &dyn BackendAdapter {
        self.adapter.as_ref()
    }

    pub fn is_running(&self, agent_id: &str) -> bool {
        self.registry.contains(agent_id)
    }

    /// Start a run for `request.agent_id`, stopping any existing process for
    /// that agent first. Returns the new run id.
    pub async fn run(self: &Arc<Self>, request: RunnerRequest) -> Result<Ulid> {
        self.launch(request, 0, None).await
    }

    async fn launch(
        self: &Arc<Self>,
        request: RunnerRequest,
        restart_count: u32,
        last_restart_time: Option<Instant>,
    ) -> Result<Ulid> {
        let agent_id = request.agent_id.clone();

        if let Some(stopping) = self.stop(&agent_id) {
            info!(agent_id = %agent_id, "waiting for previous process to stop before relaunch");
            if let Err(e) = stopping.await {
                warn!(agent_id = %agent_id, "stop escalation task failed: {e}");
            }
        }

        let mut child = match process::spawn_agent_process(self.adapter.as_ref(), &request) {
            Ok(child) => child,
            Err(e) => {
                self.observer.on_error(&agent_id, &e.to_string());
                return Err(e);
            }
        };
        let Some(pid) = child.id() else {
            let e = SupervisorError::Spawn {
                agent_id: agent_id.clone(),
                executable: self.adapter.executable_path().display().to_string(),
                reason: "process exited before its pid could be read".to_string(),
            };
            self.observer.on_error(&agent_id, &e.to_string());
            return Err(e);
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run_id = Ulid::new();
        let ctx = RunContext {
            agent_id: agent_id.clone(),
            run_id,
            pid,
            start_time: Instant::now(),
            stderr_tail: Arc::new(Mutex::new(StderrTail::new(self.config.stderr_tail_bytes))),
        };
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();

        let handle = AgentProcessHandle {
            agent_id: agent_id.clone(),
            run_id,
            pid,
            session_id: None,
            start_time: ctx.start_time,
            started_at: Utc::now(),
            last_request: request.clone(),
            restart_count,
            last_restart_time,
            stdin_tx: stdin_tx.clone(),
            stderr_tail: Arc::clone(&ctx.stderr_tail),
            exiting: false,
        };
        if let Some(displaced) = self.registry.insert(handle) {
            // A concurrent run() for the same agent spawned in between.
            warn!(
                agent_id = %agent_id,
                pid = displaced.pid,
                run_id = %displaced.run_id,
                "displacing concurrently started process"
            );
            self.mark_stopped(displaced.run_id);
            stopper::escalate(
                Arc::clone(&self.signaller),
                &agent_id,
                displaced.pid,
                EscalationSchedule::from_config(&self.config),
            );
        }
        info!(
            agent_id = %agent_id,
            pid,
            run_id = %run_id,
            backend = self.adapter.name(),
            restart_count,
            working_dir = %request.working_dir,
            "agent process spawned"
        );

        if let Some(stdin) = stdin {
            tokio::spawn(write_stdin(agent_id.clone(), stdin, stdin_rx));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(read_stderr(ctx.clone(), stderr));
        }
        let stdout_task =
            stdout.map(|stdout| tokio::spawn(Arc::clone(self).read_stdout(ctx.clone(), stdout)));

        if self.adapter.requires_stdin_input() {
            let frame = self.adapter.format_stdin_input(&request.prompt);
            if stdin_tx.send(frame).is_err() {
                warn!(
                    agent_id = %agent_id,
                    pid,
                    "stdin closed before the initial prompt was written"
                );
            }
        }
        drop(stdin_tx);

        tokio::spawn(Arc::clone(self).monitor(ctx, child, stdout_task));
        Ok(run_id)
    }

    /// Queue `text` on the agent's stdin. Returns whether it was accepted.
    pub fn send_message(&self, agent_id: &str, text: &str) -> bool {
        let Some(tx) = self.registry.stdin_of(agent_id) else {
            debug!(agent_id, "send_message: no running process");
            return false;
        };
        tx.send(self.adapter.format_stdin_input(text)).is_ok()
    }

    /// SIGINT the agent without untracking it. Claude Code aborts the
    /// current turn on one interrupt and exits on a second, so the signal
    /// goes out exactly once.
    pub fn interrupt(&self, agent_id: &str) -> bool {
        let Some(pid) = self.registry.pid_of(agent_id) else {
            return false;
        };
        info!(agent_id, pid, "interrupting agent process");
        let sig = nix::sys::signal::Signal::SIGINT;
        if !process::signal_group(pid, sig) {
            process::send_signal(pid, sig);
        }
        true
    }

    /// Untrack the agent's process and escalate signals until it is gone.
    ///
    /// A pending automatic restart is cancelled instead when no process is
    /// running. Idempotent: `None` when there was nothing to stop.
    /// `on_complete(false)` is reported immediately for a live process.
    pub fn stop(&self, agent_id: &str) -> Option<JoinHandle<()>> {
        let Some(handle) = self.registry.take(agent_id) else {
            if !self.cancel_pending_restart(agent_id) {
                return None;
            }
            info!(agent_id, "cancelled pending automatic restart");
            return Some(tokio::spawn(async {}));
        };
        info!(agent_id, pid = handle.pid, run_id = %handle.run_id, "stopping agent process");
        self.mark_stopped(handle.run_id);
        let escalation = stopper::escalate(
            Arc::clone(&self.signaller),
            agent_id,
            handle.pid,
            EscalationSchedule::from_config(&self.config),
        );
        self.observer.on_complete(agent_id, false);
        Some(escalation)
    }

    /// Stop every agent and wait for the escalations to finish. Pending
    /// automatic restarts are cancelled.
    pub async fn stop_all(&self) {
        let mut agents = self.registry.map_handles(|h| h.agent_id.clone());
        agents.extend(self.pending_restarts().keys().cloned());
        agents.sort();
        agents.dedup();
        let escalations: Vec<JoinHandle<()>> =
            agents.iter().filter_map(|a| self.stop(a)).collect();
        for escalation in escalations {
            let _ = escalation.await;
        }
    }

    pub async fn snapshots(&self) -> Vec<AgentSnapshot> {
        let views = self.registry.map_handles(|h| h.snapshot(None));
        let mut out = Vec::with_capacity(views.len());
        for mut view in views {
            view.memory_mb = process::process_memory_mb(view.pid).await;
            out.push(view);
        }
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    pub fn crash_history(&self) -> Vec<ProcessDeathRecord> {
        self.crashes.recent()
    }

    /// Finalize a death of `(agent_id, run_id)`.
    ///
    /// Returns `false` when another detector already finalized it or the
    /// handle was stopped or replaced.
    pub fn finalize(
        self: &Arc<Self>,
        agent_id: &str,
        run_id: Ulid,
        report: ExitReport,
        detector: &str,
    ) -> bool {
        let Some(handle) = self.registry.take_if_run(agent_id, run_id) else {
            return false;
        };
        let runtime = handle.start_time.elapsed();
        let class = DeathClass::classify(&report);
        info!(
            agent_id,
            pid = handle.pid,
            run_id = %run_id,
            exit_code = ?report.exit_code,
            signal = ?report.signal,
            runtime_ms = runtime.as_millis() as u64,
            detector,
            "agent process exited ({report})"
        );

        if class == DeathClass::Unexpected {
            self.crashes.record(ProcessDeathRecord {
                agent_id: agent_id.to_string(),
                pid: handle.pid,
                exit_code: report.exit_code,
                signal: report.signal.clone(),
                runtime_ms: runtime.as_millis() as u64,
                was_tracked: true,
                timestamp: Utc::now(),
                stderr_tail: handle.stderr_contents(),
            });
        }

        self.observer.on_complete(agent_id, report.is_clean());

        if class == DeathClass::Unexpected {
            self.apply_restart_policy(handle, runtime, &report);
        }
        true
    }

    fn apply_restart_policy(
        self: &Arc<Self>,
        handle: AgentProcessHandle,
        runtime: Duration,
        report: &ExitReport,
    ) {
        let agent_id = handle.agent_id.clone();
        let decision = self.policy.decide(
            DeathClass::Unexpected,
            runtime,
            handle.restart_count,
            handle.last_restart_time,
            Instant::now(),
        );
        match decision {
            RestartDecision::NotNeeded => {}
            RestartDecision::ConfigurationFailure { runtime } => {
                let err = SupervisorError::ConfigurationFailure {
                    agent_id: agent_id.clone(),
                    runtime_ms: runtime.as_millis() as u64,
                };
                warn!(agent_id = %agent_id, "{err}");
                self.observer.on_error(&agent_id, &err.to_string());
            }
            RestartDecision::BudgetExhausted { restarts } => {
                let err = SupervisorError::RestartBudgetExhausted {
                    agent_id: agent_id.clone(),
                    restarts,
                };
                error!(agent_id = %agent_id, "{err}");
                self.observer.on_error(&agent_id, &err.to_string());
            }
            RestartDecision::Restart { delay, attempt } => {
                let crash = SupervisorError::UnexpectedExit {
                    agent_id: agent_id.clone(),
                    detail: report.to_string(),
                };
                info!(
                    agent_id = %agent_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "{crash}; scheduling restart"
                );

                let mut request = handle.last_request;
                if !request.force_new_session {
                    if let Some(session_id) = handle.session_id {
                        request.session_id = Some(session_id);
                    }
                }
                let this = Arc::clone(self);
                let max_restarts = self.policy.max_restarts;
                let token = Ulid::new();
                // Held across the spawn so the task cannot claim its entry
                // before it exists.
                let mut pending = self.pending_restarts();
                let task = tokio::spawn({
                    let agent_id = agent_id.clone();
                    async move {
                        tokio::time::sleep(delay).await;
                        if !this.claim_pending_restart(&agent_id, token) {
                            // Stopped, or started again, during the delay.
                            debug!(agent_id = %agent_id, "automatic restart was cancelled");
                            return;
                        }
                        this.observer.on_output(
                            &agent_id,
                            &format!(
                                "[system] Agent process crashed; restarting automatically \
                                 ({attempt}/{max_restarts})"
                            ),
                            false,
                        );
                        if let Err(e) = this.launch(request, attempt, Some(Instant::now())).await {
                            error!(agent_id = %agent_id, attempt, "automatic restart failed: {e}");
                        }
                    }
                });
                let previous = pending.insert(
                    agent_id,
                    PendingRestart {
                        token,
                        task: task.abort_handle(),
                    },
                );
                if let Some(previous) = previous {
                    previous.task.abort();
                }
            }
        }
    }

    fn pending_restarts(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRestart>> {
        self.pending_restarts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove the pending restart for `agent_id` if it is still the one
    /// identified by `token`.
    fn claim_pending_restart(&self, agent_id: &str, token: Ulid) -> bool {
        let mut pending = self.pending_restarts();
        match pending.get(agent_id) {
            Some(entry) if entry.token == token => {
                pending.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    fn cancel_pending_restart(&self, agent_id: &str) -> bool {
        match self.pending_restarts().remove(agent_id) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    /// Whether an automatic restart is waiting out its delay.
    pub fn has_pending_restart(&self, agent_id: &str) -> bool {
        self.pending_restarts().contains_key(agent_id)
    }

    fn mark_stopped(&self, run_id: Ulid) {
        self.stopped_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id);
    }

    /// Exit of a process that was no longer tracked when it died.
    fn note_untracked_exit(&self, ctx: &RunContext, report: &ExitReport) {
        let was_stopped = self
            .stopped_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ctx.run_id);
        if !was_stopped {
            debug!(
                agent_id = %ctx.agent_id,
                pid = ctx.pid,
                run_id = %ctx.run_id,
                "exit already finalized"
            );
            return;
        }

        let by_stop_signal = matches!(
            report.signal.as_deref(),
            Some("SIGINT" | "SIGTERM" | "SIGKILL")
        );
        if report.is_clean() || by_stop_signal {
            info!(
                agent_id = %ctx.agent_id,
                pid = ctx.pid,
                "stopped agent process exited ({report})"
            );
            return;
        }

        warn!(
            agent_id = %ctx.agent_id,
            pid = ctx.pid,
            exit_code = ?report.exit_code,
            signal = ?report.signal,
            "stopped agent process exited abnormally"
        );
        let stderr_tail = ctx
            .stderr_tail
            .lock()
            .map(|tail| tail.contents())
            .unwrap_or_default();
        self.crashes.record(ProcessDeathRecord {
            agent_id: ctx.agent_id.clone(),
            pid: ctx.pid,
            exit_code: report.exit_code,
            signal: report.signal.clone(),
            runtime_ms: ctx.start_time.elapsed().as_millis() as u64,
            was_tracked: false,
            timestamp: Utc::now(),
            stderr_tail,
        });
    }

    async fn monitor(
        self: Arc<Self>,
        ctx: RunContext,
        mut child: Child,
        stdout_task: Option<JoinHandle<()>>,
    ) {
        let report = match child.wait().await {
            Ok(status) => ExitReport::from_status(status),
            Err(e) => {
                warn!(
                    agent_id = %ctx.agent_id,
                    pid = ctx.pid,
                    "failed to wait for agent process: {e}"
                );
                ExitReport::unknown()
            }
        };
        self.registry.mark_exiting(&ctx.agent_id, ctx.run_id);

        if let Some(task) = stdout_task {
            if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, task).await.is_err() {
                debug!(
                    agent_id = %ctx.agent_id,
                    pid = ctx.pid,
                    "stdout still open after exit, finalizing anyway"
                );
            }
        }

        if !self.finalize(&ctx.agent_id, ctx.run_id, report.clone(), "exit monitor") {
            self.note_untracked_exit(&ctx, &report);
        }
    }

    async fn read_stdout(self: Arc<Self>, ctx: RunContext, mut stdout: ChildStdout) {
        let mut decoder = LineDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_BYTES];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in decoder.feed(&buf[..n]) {
                        self.handle_line(&ctx, &line);
                    }
                }
                Err(e) => {
                    warn!(agent_id = %ctx.agent_id, pid = ctx.pid, "stdout read failed: {e}");
                    break;
                }
            }
        }
        if let Some(line) = decoder.finish() {
            self.handle_line(&ctx, &line);
        }
    }

    fn handle_line(&self, ctx: &RunContext, line: &str) {
        match protocol::interpret_line(self.adapter.as_ref(), line) {
            None => {}
            Some(ParsedLine::Raw(text)) => self.observer.on_output(&ctx.agent_id, &text, false),
            Some(ParsedLine::Structured { session_id, event }) => {
                if let Some(session_id) = session_id {
                    if self
                        .registry
                        .update_session(&ctx.agent_id, ctx.run_id, &session_id)
                    {
                        info!(
                            agent_id = %ctx.agent_id,
                            session_id = %session_id,
                            "session id captured"
                        );
                        self.observer.on_session_id(&ctx.agent_id, &session_id);
                    }
                }
                if let Some(event) = event {
                    self.observer.on_event(&ctx.agent_id, &event);
                    self.observer.on_output(
                        &ctx.agent_id,
                        &protocol::narrate(&event),
                        protocol::is_streaming(&event),
                    );
                }
            }
        }
    }
}

async fn read_stderr(ctx: RunContext, mut stderr: ChildStderr) {
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                debug!(
                    agent_id = %ctx.agent_id,
                    pid = ctx.pid,
                    "stderr: {}",
                    String::from_utf8_lossy(chunk).trim_end()
                );
                if let Ok(mut tail) = ctx.stderr_tail.lock() {
                    tail.push(chunk);
                }
            }
        }
    }
}

/// Drain queued messages into the pipe. `write_all` waits for the OS buffer,
/// so a full pipe delays messages instead of dropping them.
async fn write_stdin(
    agent_id: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = stdin.write_all(message.as_bytes()).await {
            debug!(agent_id = %agent_id, "stdin closed: {e}");
            break;
        }
        if let Err(e) = stdin.flush().await {
            debug!(agent_id = %agent_id, "stdin flush failed: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::generic::GenericJsonAdapter;
    use crate::observer::{ChannelObserver, SupervisorNotice};
    use crate::registry::tests::handle;

    fn supervisor() -> (Arc<AgentSupervisor>, mpsc::UnboundedReceiver<SupervisorNotice>) {
        let (observer, rx) = ChannelObserver::new();
        let sup = AgentSupervisor::new(
            Arc::new(GenericJsonAdapter::new("/bin/sh", Vec::new())),
            Arc::new(observer),
            SupervisorConfig::default(),
        );
        (sup, rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_detectors_finalize_exactly_once() {
        let (sup, mut rx) = supervisor();
        let h = handle("a1", 9_999_999);
        let run_id = h.run_id;
        sup.registry().insert(h);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let sup = Arc::clone(&sup);
            let detector = if i % 2 == 0 { "exit monitor" } else { "watchdog" };
            tasks.push(tokio::spawn(async move {
                sup.finalize("a1", run_id, ExitReport::unknown(), detector)
            }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(sup.crash_history().len(), 1);
        assert!(!sup.is_running("a1"));

        let mut completes = 0;
        while let Ok(notice) = rx.try_recv() {
            if matches!(notice, SupervisorNotice::Complete { .. }) {
                completes += 1;
            }
        }
        assert_eq!(completes, 1);
    }

    #[tokio::test]
    async fn stale_run_id_does_not_finalize_successor() {
        let (sup, _rx) = supervisor();
        let h = handle("a1", 9_999_999);
        sup.registry().insert(h);

        assert!(!sup.finalize("a1", Ulid::new(), ExitReport::unknown(), "exit monitor"));
        assert!(sup.is_running("a1"));
        assert!(sup.crash_history().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_reports_completion_once() {
        let (sup, mut rx) = supervisor();
        sup.registry().insert(handle("a1", 9_999_999));

        assert!(sup.stop("a1").is_some());
        assert!(sup.stop("a1").is_none());
        assert_eq!(
            rx.try_recv().unwrap(),
            SupervisorNotice::Complete {
                agent_id: "a1".to_string(),
                success: false
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn clean_exit_is_not_recorded_as_a_crash() {
        let (sup, mut rx) = supervisor();
        let h = handle("a1", 9_999_999);
        let run_id = h.run_id;
        sup.registry().insert(h);

        let clean = ExitReport {
            exit_code: Some(0),
            signal: None,
        };
        assert!(sup.finalize("a1", run_id, clean, "exit monitor"));
        assert!(sup.crash_history().is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            SupervisorNotice::Complete {
                agent_id: "a1".to_string(),
                success: true
            }
        );
    }
}
