use std::path::PathBuf;

use thiserror::Error;

/// Everything that can end a monitoring run early, plus the two
/// not-really-errors (`AlreadyDone`, `Skipped`) that let the CLI map a
/// single `match` onto an exit code without a separate early-return path.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("output directory is not ours to monitor: {0}")]
    WrongOutputDir(PathBuf),

    #[error("run already monitored: {0}")]
    AlreadyDone(PathBuf),

    #[error("monitoring explicitly skipped for: {0}")]
    Skipped(PathBuf),

    #[error("external tool `{tool}` failed (status {status}): {stderr}")]
    ExternalFailure {
        tool: String,
        status: i32,
        stderr: String,
    },

    #[error("worker panicked: {0}")]
    WorkerPanic(String),

    #[error("data model violation: {0}")]
    DataModelViolation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    SerializationOut(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;

impl MonitorError {
    /// Maps a terminal error onto a process exit code. `AlreadyDone` and
    /// `Skipped` are successful early exits, matching the original
    /// orchestrator's behavior of treating both as "nothing to do here".
    pub fn exit_code(&self) -> i32 {
        match self {
            MonitorError::AlreadyDone(_) | MonitorError::Skipped(_) => 0,
            _ => 1,
        }
    }
}
