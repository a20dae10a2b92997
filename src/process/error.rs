use std::fmt;
use std::io;
use thiserror::Error;

use super::ExecutionResult;

/// Result type for process operations
pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

/// Why an invocation ended the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltCause {
    /// An output line matched a rule at fatal level
    FatalLine,
    /// `halt_on_failure` was set and the command failed
    Failure,
}

/// Carries everything the top-level driver needs to terminate the process
#[derive(Debug, Clone)]
pub struct HaltReport {
    pub cause: HaltCause,
    pub message: String,
    /// Exit code the harness process should terminate with
    pub exit_code: i32,
    /// Result of the invocation up to the point it halted
    pub result: ExecutionResult,
}

impl fmt::Display for HaltReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (exit code {})", self.message, self.exit_code)
    }
}

/// Errors that can occur during process operations
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnError(io::Error),

    #[error("Failed to create output pipe: {0}")]
    PipeError(io::Error),

    #[error("Failed to read from process: {0}")]
    ReadError(io::Error),

    #[error("Failed to wait for process: {0}")]
    WaitError(io::Error),

    #[error("Temporary output file error: {0}")]
    TempFile(io::Error),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Halting: {0}")]
    Halt(HaltReport),
}
