use std::path::PathBuf;
use std::time::Duration;

/// Which agent CLI protocol the supervisor speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Claude,
    Generic,
}

impl BackendKind {
    fn from_env(value: &str) -> anyhow::Result<Self> {
        match value {
            "claude" => Ok(Self::Claude),
            "generic" => Ok(Self::Generic),
            other => Err(anyhow::anyhow!(
                "Invalid AGENT_BACKEND '{other}'. Expected 'claude' or 'generic'"
            )),
        }
    }
}

/// Tuning knobs of the supervisor itself.
///
/// The defaults are empirically chosen; none of them is a structural
/// invariant, so every one can be overridden.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often the watchdog probes tracked pids
    pub watchdog_interval: Duration,
    /// Delay between the stop interrupt and SIGTERM
    pub stop_term_after: Duration,
    /// Delay between the stop interrupt and SIGKILL
    pub stop_kill_after: Duration,
    /// Deaths sooner than this after spawn are treated as startup failures
    pub min_runtime: Duration,
    /// A restart older than this resets the restart counter
    pub restart_cooldown: Duration,
    /// Restarts allowed inside one cooldown window
    pub max_restarts: u32,
    /// Pause before relaunching a crashed agent
    pub restart_delay: Duration,
    /// Death records retained in the crash ring buffer
    pub crash_history: usize,
    /// Window used for crash pattern analysis
    pub crash_window: Duration,
    /// Deaths inside the window needed before a pattern is flagged
    pub crash_pattern_threshold: usize,
    /// Bytes of stderr kept per process
    pub stderr_tail_bytes: usize,
    /// How often live processes are written to the state file
    pub persist_interval: Duration,
    /// How often logical statuses are reconciled
    pub reconcile_interval: Duration,
    /// Session artifacts modified within this window count as active
    pub artifact_freshness: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watchdog_interval: Duration::from_secs(5),
            stop_term_after: Duration::from_millis(500),
            stop_kill_after: Duration::from_millis(1500),
            min_runtime: Duration::from_secs(5),
            restart_cooldown: Duration::from_secs(60),
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
            crash_history: 50,
            crash_window: Duration::from_secs(60),
            crash_pattern_threshold: 3,
            stderr_tail_bytes: 2048,
            persist_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(30),
            artifact_freshness: Duration::from_secs(30),
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();
        let config = Self {
            watchdog_interval: env_duration_ms(
                "SUPERVISOR_WATCHDOG_INTERVAL_MS",
                d.watchdog_interval,
            )?,
            stop_term_after: env_duration_ms("SUPERVISOR_STOP_TERM_AFTER_MS", d.stop_term_after)?,
            stop_kill_after: env_duration_ms("SUPERVISOR_STOP_KILL_AFTER_MS", d.stop_kill_after)?,
            min_runtime: env_duration_ms("SUPERVISOR_MIN_RUNTIME_MS", d.min_runtime)?,
            restart_cooldown: env_duration_ms(
                "SUPERVISOR_RESTART_COOLDOWN_MS",
                d.restart_cooldown,
            )?,
            max_restarts: env_parse("SUPERVISOR_MAX_RESTARTS", d.max_restarts)?,
            restart_delay: env_duration_ms("SUPERVISOR_RESTART_DELAY_MS", d.restart_delay)?,
            crash_history: env_parse("SUPERVISOR_CRASH_HISTORY", d.crash_history)?,
            crash_window: env_duration_ms("SUPERVISOR_CRASH_WINDOW_MS", d.crash_window)?,
            crash_pattern_threshold: env_parse(
                "SUPERVISOR_CRASH_PATTERN_THRESHOLD",
                d.crash_pattern_threshold,
            )?,
            stderr_tail_bytes: env_parse("SUPERVISOR_STDERR_TAIL_BYTES", d.stderr_tail_bytes)?,
            persist_interval: env_duration_ms(
                "SUPERVISOR_PERSIST_INTERVAL_MS",
                d.persist_interval,
            )?,
            reconcile_interval: env_duration_ms(
                "SUPERVISOR_RECONCILE_INTERVAL_MS",
                d.reconcile_interval,
            )?,
            artifact_freshness: env_duration_ms(
                "SUPERVISOR_ARTIFACT_FRESHNESS_MS",
                d.artifact_freshness,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the stop escalation run backwards.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stop_kill_after < self.stop_term_after {
            return Err(anyhow::anyhow!(
                "SUPERVISOR_STOP_KILL_AFTER_MS ({}ms) is shorter than \
                 SUPERVISOR_STOP_TERM_AFTER_MS ({}ms)",
                self.stop_kill_after.as_millis(),
                self.stop_term_after.as_millis()
            ));
        }
        if self.crash_history == 0 {
            return Err(anyhow::anyhow!("SUPERVISOR_CRASH_HISTORY must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration of the `supervisor` binary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the admin API listens on
    pub port: u16,
    /// Agent CLI protocol
    pub backend: BackendKind,
    /// Path to the agent CLI executable
    pub agent_binary: String,
    /// Arguments prepended for the generic backend
    pub agent_args: Vec<String>,
    /// Where live process metadata is persisted between supervisor runs
    pub state_file: PathBuf,
    /// Root of the on-disk session transcripts
    pub sessions_dir: PathBuf,
    pub supervisor: SupervisorConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let backend = BackendKind::from_env(&env_str("AGENT_BACKEND", "claude"))?;
        let default_binary = match backend {
            BackendKind::Claude => "claude",
            BackendKind::Generic => "agent",
        };

        Ok(Self {
            port: env_parse("SUPERVISOR_PORT", 9191)?,
            backend,
            agent_binary: env_str("AGENT_BINARY", default_binary),
            agent_args: env_csv("AGENT_ARGS", &[]),
            state_file: PathBuf::from(env_str("AGENT_STATE_FILE", "./data/agent-processes.json")),
            sessions_dir: std::env::var("AGENT_SESSIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_sessions_dir()),
            supervisor: SupervisorConfig::from_env()?,
        })
    }
}

/// `~/.claude/projects`, where Claude Code keeps its JSONL transcripts.
fn default_sessions_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_duration_ms(key: &str, default: Duration) -> anyhow::Result<Duration> {
    let ms = env_parse(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
