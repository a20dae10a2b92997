//! Command execution and output classification
//!
//! This module runs external commands on behalf of harness actions. Output
//! is either streamed line by line through a list of [`ErrorRule`]s, or
//! captured into temporary files and handed back to the caller. The
//! [`CommandRunner`] turns the exit code and the error tally into a result,
//! or into a [`HaltReport`] when the run has to end.

mod collector;
mod command;
mod error;
mod rules;
mod runner;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use collector::{CaptureFiles, Captured, OutputCollector};
pub use command::{Command, CommandLine};
pub use error::{HaltCause, HaltReport, ProcessError, ProcessResult};
pub use rules::{
    builtin_rules, compile_rules, match_line, ContextLines, ErrorRule, RuleMatch, RuleSpec,
    DEFAULT_FATAL_EXIT_CODE,
};
pub use runner::CommandRunner;

/// Exit code reported for commands that were never started
pub const NOT_RUN: i32 = -1;

/// Shape of the value a caller wants back from an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// The exit code; output is streamed and classified
    #[default]
    Status,
    /// The captured standard output
    Output,
    /// The number of lines matched at error level or above
    #[serde(alias = "num_errors")]
    ErrorCount,
}

/// Overall classification of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    /// The invocation ended the whole run
    Halted,
    /// Dry run, or the command could not be started
    NotRun,
}

/// The value selected by a [`ResultKind`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultValue {
    Status(i32),
    Output(String),
    ErrorCount(usize),
}

/// What happened when a command was run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code, or [`NOT_RUN`]
    pub exit_code: i32,
    /// Lines matched at error, critical or fatal level
    pub error_count: usize,
    /// Captured standard output, only in [`ResultKind::Output`] mode
    pub output: Option<String>,
    pub outcome: Outcome,
}

impl ExecutionResult {
    /// Result for a command that never started
    pub fn not_run(outcome: Outcome) -> Self {
        Self {
            exit_code: NOT_RUN,
            error_count: 0,
            output: None,
            outcome,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Pick the value the caller asked for
    pub fn value(&self, kind: ResultKind) -> ResultValue {
        match kind {
            ResultKind::Status => ResultValue::Status(self.exit_code),
            ResultKind::Output => ResultValue::Output(self.output.clone().unwrap_or_default()),
            ResultKind::ErrorCount => ResultValue::ErrorCount(self.error_count),
        }
    }
}

/// A command plus the policy to run it under
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    command: Command,
    rules: Vec<ErrorRule>,
    halt_on_failure: bool,
    success_codes: Option<BTreeSet<i32>>,
    result_kind: ResultKind,
    silent: bool,
}

impl ExecutionRequest {
    /// Create a request with no rules, no halting, and the context's
    /// accepted exit codes
    pub fn new(command: Command) -> Self {
        Self {
            command,
            rules: Vec::new(),
            halt_on_failure: false,
            success_codes: None,
            result_kind: ResultKind::Status,
            silent: false,
        }
    }

    pub fn rules(mut self, rules: Vec<ErrorRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn halt_on_failure(mut self, halt: bool) -> Self {
        self.halt_on_failure = halt;
        self
    }

    /// Override the accepted exit codes for this request
    pub fn success_codes<I: IntoIterator<Item = i32>>(mut self, codes: I) -> Self {
        self.success_codes = Some(codes.into_iter().collect());
        self
    }

    pub fn result_kind(mut self, kind: ResultKind) -> Self {
        self.result_kind = kind;
        self
    }

    /// Don't log captured standard output
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn error_rules(&self) -> &[ErrorRule] {
        &self.rules
    }

    pub fn halts_on_failure(&self) -> bool {
        self.halt_on_failure
    }

    pub fn accepted_codes(&self) -> Option<&BTreeSet<i32>> {
        self.success_codes.as_ref()
    }

    pub fn kind(&self) -> ResultKind {
        self.result_kind
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }
}
