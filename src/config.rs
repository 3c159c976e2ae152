//! Configuration types.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::session::{RoutingRule, SessionConfig};

/// Name of the session synthesised when none are declared.
pub const MAIN_SESSION: &str = "main";

/// How to launch an agent subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentCommand {
    /// Executable to run.
    pub program: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self {
            program: "pi".to_string(),
            args: vec!["--mode".to_string(), "rpc".to_string()],
            env: HashMap::new(),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Root directory holding job files.
    pub jobs_dir: PathBuf,
    /// Global grace period after user interaction, in milliseconds.
    pub grace_period_ms: Option<u64>,
    /// Debounce window for filesystem events, in milliseconds.
    pub debounce_ms: u64,
    /// Session used by jobs that don't name one. Falls back to the session
    /// manager's default.
    pub default_session: Option<String>,
}

impl SchedulerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jobs_dir: PathBuf::from("./cron"),
            grace_period_ms: None,
            debounce_ms: 500,
            default_session: None,
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Agent launch command shared by all sessions unless overridden.
    pub agent: AgentCommand,
    /// Working directory for the synthesised single session.
    pub cwd: PathBuf,
    /// Idle timeout for the synthesised single session.
    pub idle_timeout_minutes: Option<u64>,
    /// Explicitly declared sessions.
    pub sessions: Vec<SessionConfig>,
    /// Ordered platform/channel routing rules.
    pub routing: Vec<RoutingRule>,
    /// Session used when no routing rule matches.
    pub default_session: Option<String>,
    pub scheduler: SchedulerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            agent: AgentCommand::default(),
            cwd: PathBuf::from("."),
            idle_timeout_minutes: None,
            sessions: Vec::new(),
            routing: Vec::new(),
            default_session: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Build configuration from `AGENT_DAEMON_*` environment variables.
    ///
    /// When `AGENT_DAEMON_CONFIG` names a file, it is loaded instead and the
    /// remaining variables are ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("AGENT_DAEMON_CONFIG") {
            return Self::from_yaml_file(Path::new(&path));
        }

        let mut config = Self::default();

        if let Ok(program) = std::env::var("AGENT_DAEMON_AGENT") {
            config.agent.program = program;
        }
        if let Ok(args) = std::env::var("AGENT_DAEMON_AGENT_ARGS") {
            config.agent.args = args.split_whitespace().map(String::from).collect();
        }
        if let Ok(cwd) = std::env::var("AGENT_DAEMON_CWD") {
            config.cwd = PathBuf::from(cwd);
        }
        if let Ok(minutes) = std::env::var("AGENT_DAEMON_IDLE_TIMEOUT_MIN") {
            config.idle_timeout_minutes = Some(parse_env("AGENT_DAEMON_IDLE_TIMEOUT_MIN", &minutes)?);
        }
        if let Ok(dir) = std::env::var("AGENT_DAEMON_JOBS_DIR") {
            config.scheduler.jobs_dir = PathBuf::from(dir);
        }
        if let Ok(grace) = std::env::var("AGENT_DAEMON_GRACE_PERIOD_MS") {
            config.scheduler.grace_period_ms = Some(parse_env("AGENT_DAEMON_GRACE_PERIOD_MS", &grace)?);
        }

        Ok(config)
    }

    /// Load configuration from a YAML document on disk.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Sessions to manage. Without explicit sessions a single `"main"` session
    /// is synthesised from the top-level agent settings.
    pub fn session_configs(&self) -> Vec<SessionConfig> {
        if !self.sessions.is_empty() {
            return self.sessions.clone();
        }
        vec![SessionConfig {
            name: MAIN_SESSION.to_string(),
            cwd: self.cwd.clone(),
            idle_timeout_minutes: self.idle_timeout_minutes,
            command: None,
        }]
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
