//! OS process plumbing: spawning into a detached process group, signalling,
//! liveness probes, memory queries and the stderr tail.

use std::collections::VecDeque;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use shared_types::RunnerRequest;
use tokio::process::{Child, Command};
use tracing::{debug, error, warn};

use crate::adapter::BackendAdapter;
use crate::error::{Result, SupervisorError};

/// Spawn the backend process for a request.
///
/// The child leads its own process group so signals can reach the whole
/// tree, and so it is not torn down with the supervisor's terminal session.
/// Its pipes still die with the supervisor; there is no reattachment.
pub fn spawn_agent_process(adapter: &dyn BackendAdapter, request: &RunnerRequest) -> Result<Child> {
    let executable = adapter.executable_path();
    let args = adapter.build_args(request);

    let mut std_cmd = std::process::Command::new(&executable);
    std_cmd
        .args(&args)
        .current_dir(&request.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Claude Code refuses to start inside another Claude Code session.
        .env_remove("CLAUDECODE")
        .process_group(0);

    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(false);

    cmd.spawn().map_err(|e| {
        error!(
            agent_id = %request.agent_id,
            executable = %executable.display(),
            backend = adapter.name(),
            "failed to spawn agent process: {e}"
        );
        SupervisorError::Spawn {
            agent_id: request.agent_id.clone(),
            executable: executable.display().to_string(),
            reason: e.to_string(),
        }
    })
}

/// Send a signal to one process. Returns whether it was delivered.
///
/// ESRCH (already dead) and EPERM are expected races and only logged.
pub fn send_signal(pid: u32, sig: Signal) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {
            debug!(pid, signal = ?sig, "signal sent");
            true
        }
        Err(Errno::ESRCH) => {
            debug!(pid, signal = ?sig, "process already dead (ESRCH)");
            false
        }
        Err(e) => {
            warn!(pid, signal = ?sig, "failed to signal process: {e}");
            false
        }
    }
}

/// Send a signal to a whole process group. Same error policy as [`send_signal`].
pub fn signal_group(pgid: u32, sig: Signal) -> bool {
    match signal::killpg(Pid::from_raw(pgid as i32), sig) {
        Ok(()) => {
            debug!(pgid, signal = ?sig, "group signal sent");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, signal = ?sig, "failed to signal process group: {e}");
            false
        }
    }
}

/// Whether `pid` refers to a live (non-zombie) process.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let exists = matches!(
        signal::kill(Pid::from_raw(pid as i32), None),
        Ok(()) | Err(Errno::EPERM)
    );
    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Format: "<pid> (<comm>) <state> ..."; comm may contain spaces or parens.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Resident memory of a process in MB, or `None` when it cannot be read.
pub async fn process_memory_mb(pid: u32) -> Option<f64> {
    if cfg!(target_os = "linux") {
        let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
            .await
            .ok()?;
        return parse_vm_rss_kb(&status).map(|kb| kb as f64 / 1024.0);
    }

    let output = Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<u64>()
        .ok()
        .map(|kb| kb as f64 / 1024.0)
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// How a process ended, as far as the OS told us.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitReport {
    /// Death seen by the watchdog: no status is available.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            exit_code: status.code(),
            signal: status.signal().map(signal_name),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.exit_code == Some(0)
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.exit_code, &self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Name of a raw signal number, e.g. `SIGKILL`.
pub fn signal_name(sig: i32) -> String {
    Signal::try_from(sig)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{sig}"))
}

/// Fixed-size tail of a process's stderr.
#[derive(Debug)]
pub struct StderrTail {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        let chunk = if chunk.len() > self.capacity {
            &chunk[chunk.len() - self.capacity..]
        } else {
            chunk
        };
        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(chunk);
    }

    /// The retained bytes as text. A character cut at the front becomes U+FFFD.
    pub fn contents(&self) -> String {
        let (a, b) = self.buf.as_slices();
        let mut bytes = Vec::with_capacity(self.buf.len());
        bytes.extend_from_slice(a);
        bytes.extend_from_slice(b);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_last_bytes() {
        let mut tail = StderrTail::new(8);
        tail.push(b"hello ");
        tail.push(b"world!");
        assert_eq!(tail.contents(), "o world!");
        tail.push(b"0123456789abcdef");
        assert_eq!(tail.contents(), "89abcdef");
    }

    #[test]
    fn parse_vm_rss_from_proc_status() {
        let status = "Name:\tclaude\nVmPeak:\t  9000 kB\nVmRSS:\t  20480 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss_kb(status), Some(20480));
        assert_eq!(parse_vm_rss_kb("Name:\tx\n"), None);
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn exit_report_describes_itself() {
        let by_signal = ExitReport {
            exit_code: None,
            signal: Some(signal_name(9)),
        };
        assert_eq!(by_signal.to_string(), "signal SIGKILL");
        assert!(!ExitReport::unknown().is_clean());
        assert_eq!(ExitReport::unknown().to_string(), "unknown exit status");
    }

    #[tokio::test]
    async fn memory_of_current_process_is_known() {
        let mb = process_memory_mb(std::process::id()).await;
        assert!(mb.is_some_and(|mb| mb > 0.0));
    }
}
