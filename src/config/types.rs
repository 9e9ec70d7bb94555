/// Core types shared by the runner, the task manager and the command executor
use crate::runtime::security::SecurityViolation;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// How a wrapped process ended, as far as the runner could determine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Not run yet, or the run has not been resolved
    #[default]
    Unknown,
    /// Process exited normally with an exit code
    Exited,
    /// Process exceeded its CPU or wall-clock budget
    TimedOut,
    /// Process was terminated by a signal other than a limit signal
    KilledBySignal,
    /// Process could not be started, or its fate is unknowable
    CouldNotStart,
    /// Process tried to grow a file past the file size limit
    FileSizeLimitExceeded,
}

impl ProcessStatus {
    /// Statuses for which stderr is never reported
    pub fn suppresses_stderr(self) -> bool {
        matches!(
            self,
            ProcessStatus::TimedOut | ProcessStatus::FileSizeLimitExceeded
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessStatus::Unknown => "UNKNOWN",
            ProcessStatus::Exited => "EXITED",
            ProcessStatus::TimedOut => "TIMED_OUT",
            ProcessStatus::KilledBySignal => "KILLED_BY_SIGNAL",
            ProcessStatus::CouldNotStart => "COULD_NOT_START",
            ProcessStatus::FileSizeLimitExceeded => "FILE_SIZE_LIMIT_EXCEEDED",
        };
        f.write_str(name)
    }
}

/// Result of running one command against one input
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit code, or the signal number for signal terminations
    pub exit_code: i32,
    /// Captured stdout lines (bounded)
    pub stdout: Vec<String>,
    /// Captured stderr lines (bounded); always empty for limit terminations
    pub stderr: Vec<String>,
    /// Termination cause
    pub status: ProcessStatus,
    /// Human-readable explanation of the status
    pub status_message: String,
}

impl CommandResult {
    /// A result for a run that produced no usable output
    pub fn failed(status: ProcessStatus, message: impl Into<String>) -> Self {
        CommandResult {
            exit_code: -1,
            stdout: Vec::new(),
            stderr: Vec::new(),
            status,
            status_message: message.into(),
        }
    }

    /// The canonical result of a run that was stopped at its deadline
    pub fn timed_out() -> Self {
        Self::failed(ProcessStatus::TimedOut, "Process timed out")
    }

    /// Whether the process ran to completion and exited with code 0
    pub fn is_success(&self) -> bool {
        self.status == ProcessStatus::Exited && self.exit_code == 0
    }
}

/// Outcome of one task in a batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome<T> {
    /// True iff the task completed on its own before the deadline
    pub finished: bool,
    /// The task's result, or the timeout default
    pub result: T,
}

/// Error types for gradebox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Wrapper error: {0}")]
    Wrapper(String),

    #[error("Security violation: {0}")]
    Security(#[from] SecurityViolation),

    #[error("Task error: {0}")]
    Task(String),
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(format!("System call failed: {}", err))
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Config(format!("Invalid JSON: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
