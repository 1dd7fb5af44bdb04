//! Crash recorder and pattern analyzer.
//!
//! Unexpected deaths go into a bounded ring buffer. After each one, the
//! recent window is checked for correlated failures. Findings are logged
//! and returned; they never change what the supervisor does next.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared_types::ProcessDeathRecord;
use tracing::warn;

use crate::config::SupervisorConfig;
use crate::process::ExitReport;

/// How a death is treated by finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathClass {
    /// Exit code 0
    Clean,
    /// Killed by the stop signal (SIGINT)
    Intentional,
    /// Everything else, including deaths with no known status
    Unexpected,
}

impl DeathClass {
    pub fn classify(report: &ExitReport) -> Self {
        if report.is_clean() {
            DeathClass::Clean
        } else if report.signal.as_deref() == Some("SIGINT") {
            DeathClass::Intentional
        } else {
            DeathClass::Unexpected
        }
    }
}

/// A correlation found among recent deaths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashPattern {
    /// Every recent death came from the same signal: something outside is
    /// killing agents.
    SharedSignal { signal: String, deaths: usize },
    /// Every recent death had the same exit code.
    SharedExitCode { exit_code: i32, deaths: usize },
}

impl CrashPattern {
    /// Likely cause, for the exit codes that have a well-known one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CrashPattern::SharedSignal { .. } => Some("possible external killer"),
            CrashPattern::SharedExitCode { exit_code: 137, .. } => {
                Some("likely out-of-memory kill")
            }
            CrashPattern::SharedExitCode { exit_code: 1, .. } => {
                Some("likely startup or configuration error")
            }
            CrashPattern::SharedExitCode { .. } => None,
        }
    }
}

impl std::fmt::Display for CrashPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrashPattern::SharedSignal { signal, deaths } => {
                write!(f, "{deaths} recent deaths all by {signal}")?
            }
            CrashPattern::SharedExitCode { exit_code, deaths } => {
                write!(f, "{deaths} recent deaths all with exit code {exit_code}")?
            }
        }
        if let Some(hint) = self.hint() {
            write!(f, " ({hint})")?;
        }
        Ok(())
    }
}

/// Look for a shared signal or exit code among deaths inside `window`.
pub fn analyze(
    records: &VecDeque<ProcessDeathRecord>,
    now: DateTime<Utc>,
    window: Duration,
    threshold: usize,
) -> Option<CrashPattern> {
    let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(365));
    let recent: Vec<&ProcessDeathRecord> = records
        .iter()
        .filter(|r| now.signed_duration_since(r.timestamp) <= window)
        .collect();
    if recent.len() < threshold.max(1) {
        return None;
    }

    let first = recent[0];
    if let Some(signal) = &first.signal {
        if recent.iter().all(|r| r.signal.as_ref() == Some(signal)) {
            return Some(CrashPattern::SharedSignal {
                signal: signal.clone(),
                deaths: recent.len(),
            });
        }
    }
    if let Some(code) = first.exit_code {
        if recent.iter().all(|r| r.exit_code == Some(code)) {
            return Some(CrashPattern::SharedExitCode {
                exit_code: code,
                deaths: recent.len(),
            });
        }
    }
    None
}

/// Bounded, append-only history of unexpected deaths.
#[derive(Debug)]
pub struct CrashRecorder {
    history: Mutex<VecDeque<ProcessDeathRecord>>,
    capacity: usize,
    window: Duration,
    threshold: usize,
}

impl CrashRecorder {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(config.crash_history)),
            capacity: config.crash_history.max(1),
            window: config.crash_window,
            threshold: config.crash_pattern_threshold,
        }
    }

    /// Append a record and analyze the recent window.
    pub fn record(&self, record: ProcessDeathRecord) -> Option<CrashPattern> {
        let now = record.timestamp;
        let agent_id = record.agent_id.clone();
        let pattern = {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(record);
            analyze(&history, now, self.window, self.threshold)
        };
        if let Some(pattern) = &pattern {
            warn!(agent_id = %agent_id, "crash pattern detected: {pattern}");
        }
        pattern
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<ProcessDeathRecord> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
