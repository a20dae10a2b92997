use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::trace;
use serde::{Deserialize, Serialize};
use tokio::process::Command as TokioCommand;

use crate::process::{ProcessError, ProcessResult};

#[cfg(unix)]
const SHELL: (&str, &str) = ("sh", "-c");
#[cfg(windows)]
const SHELL: (&str, &str) = ("cmd", "/C");

/// A command as written by the caller: one shell string or an argument vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    /// Copy-pasteable rendering for logs
    pub fn display(&self) -> String {
        match self {
            CommandLine::Shell(line) => line.clone(),
            CommandLine::Argv(argv) => shell_words::join(argv),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

impl From<&str> for CommandLine {
    fn from(line: &str) -> Self {
        CommandLine::Shell(line.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(line: String) -> Self {
        CommandLine::Shell(line)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(argv: Vec<String>) -> Self {
        CommandLine::Argv(argv)
    }
}

impl From<Vec<&str>> for CommandLine {
    fn from(argv: Vec<&str>) -> Self {
        CommandLine::Argv(argv.into_iter().map(String::from).collect())
    }
}

/// Command wrapper for process execution
#[derive(Debug, Clone)]
pub struct Command {
    /// What to run
    line: CommandLine,

    /// Whether to run through the system shell
    shell: bool,

    /// Current working directory
    current_dir: Option<PathBuf>,

    /// Environment variables merged over the inherited environment
    env_vars: HashMap<String, String>,
}

impl Command {
    /// Create a new command. Shell strings default to shell mode, argument
    /// vectors to direct execution.
    pub fn new<L: Into<CommandLine>>(line: L) -> Self {
        let line = line.into();
        let shell = matches!(line, CommandLine::Shell(_));
        Self {
            line,
            shell,
            current_dir: None,
            env_vars: HashMap::new(),
        }
    }

    /// Set whether to run through the system shell
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Set the current working directory
    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars.insert(key.into(), val.into());
        self
    }

    /// Add multiple environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, val) in vars {
            self.env_vars.insert(key.into(), val.into());
        }
        self
    }

    pub fn dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn is_shell(&self) -> bool {
        self.shell
    }

    /// Copy-pasteable rendering for logs
    pub fn display(&self) -> String {
        self.line.display()
    }

    /// Resolve the command line into a program and its arguments
    pub fn program_and_args(&self) -> ProcessResult<(String, Vec<String>)> {
        let argv = match (&self.line, self.shell) {
            (CommandLine::Shell(line), true) => {
                vec![SHELL.0.to_string(), SHELL.1.to_string(), line.clone()]
            }
            (CommandLine::Argv(argv), true) => {
                vec![SHELL.0.to_string(), SHELL.1.to_string(), shell_words::join(argv)]
            }
            (CommandLine::Shell(line), false) => shell_words::split(line)
                .map_err(|e| ProcessError::InvalidCommand(format!("{}: {}", line, e)))?,
            (CommandLine::Argv(argv), false) => argv.clone(),
        };

        let mut parts = argv.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ProcessError::InvalidCommand("empty command".to_string()))?;

        Ok((program, parts.collect()))
    }

    /// Build the tokio command with stdin closed and the given output handles
    pub(crate) fn to_tokio(&self, stdout: Stdio, stderr: Stdio) -> ProcessResult<TokioCommand> {
        let (program, args) = self.program_and_args()?;
        trace!("Resolved command: {} {:?}", program, args);

        let mut cmd = TokioCommand::new(&program);
        cmd.args(&args);

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        for (key, val) in &self.env_vars {
            cmd.env(key, val);
        }

        cmd.stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        Ok(cmd)
    }
}
