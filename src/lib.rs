//! A build and release automation harness
//!
//! Scripts declare named actions that run external commands. Every line a
//! command prints is classified against configurable error rules, and the
//! resulting error tally and exit code decide whether the run continues.

pub mod config;
pub mod context;
pub mod error;
pub mod process;
pub mod script;
pub mod sink;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::config::{ConfigBuilder, HarnessConfig};
    pub use crate::context::ExecutionContext;
    pub use crate::error::{HarnessError, Result};
    pub use crate::process::{
        Command, CommandRunner, ErrorRule, ExecutionRequest, ExecutionResult, Outcome,
        ResultKind,
    };
    pub use crate::script::Script;
    pub use crate::sink::{Level, LogSink, StdLogSink};
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
