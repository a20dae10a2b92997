// src/error.rs
use std::io;
use thiserror::Error;

use crate::process::{HaltReport, ProcessError};

/// Result type used throughout the harness library
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Custom Error type for the harness library
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Rule error: {0}")]
    Rule(String),

    #[error("Action error: {0}")]
    Action(String),

    #[error(transparent)]
    Process(ProcessError),

    #[error("{0}")]
    Halt(HaltReport),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarnessError {
    /// The halt report if this error must end the whole run
    pub fn halt(&self) -> Option<&HaltReport> {
        match self {
            HarnessError::Halt(report) => Some(report),
            _ => None,
        }
    }
}

impl From<ProcessError> for HarnessError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Halt(report) => HarnessError::Halt(report),
            other => HarnessError::Process(other),
        }
    }
}
