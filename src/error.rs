//! Error types for the agent daemon.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a single agent subprocess bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Agent {name} is not running")]
    NotRunning { name: String },

    #[error("Agent {name} is busy with another prompt")]
    Busy { name: String },

    #[error("Agent {name} process exited")]
    ProcessExited { name: String },

    #[error("Agent {name} still had an open prompt after {grace:?}")]
    StopTimeout { name: String, grace: Duration },

    #[error("Command {command} failed: {message}")]
    Rpc { command: String, message: String },

    #[error("Failed to spawn agent {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Arguments for command {command} must be a JSON object")]
    InvalidArgs { command: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether this error means the subprocess went away under the caller.
    pub fn is_process_exit(&self) -> bool {
        matches!(self, Self::ProcessExited { .. })
    }
}

/// Session lifecycle errors.
///
/// Cloneable because a single start attempt is shared by every caller that
/// was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session {name} did not start within {timeout:?}")]
    StartTimeout { name: String, timeout: Duration },

    #[error("Session {name} failed to start: {reason}")]
    StartFailed { name: String, reason: String },
}

/// Errors parsing a job file.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job file {path} has no frontmatter")]
    MissingFrontmatter { path: PathBuf },

    #[error("Invalid frontmatter in {path}: {reason}")]
    InvalidFrontmatter { path: PathBuf, reason: String },

    #[error("Invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort a job's step pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("No model matches '{query}'")]
    NoModelMatch { query: String },

    #[error("Unexpected model list: {0}")]
    InvalidModelList(String),
}

/// Scheduler-level errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the daemon.
pub type Result<T> = std::result::Result<T, Error>;
