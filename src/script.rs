//! Named action sequencing
//!
//! A script is an ordered list of action names resolved against the
//! `actions` table of the configuration. Each action either runs a command
//! through the [`CommandRunner`] or performs a dry-run aware file operation.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::config::{ActionStep, HarnessConfig, RunStep};
use crate::context::ExecutionContext;
use crate::error::{HarnessError, Result};
use crate::process::{
    compile_rules, Command, CommandRunner, ExecutionRequest, Outcome, ResultValue,
};
use crate::sink::{Level, LogSink};

/// File the effective configuration is written to
pub const LOCAL_CONFIG: &str = "localconfig.json";

/// What happened to each action of a finished script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

impl ScriptReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A configured sequence of actions
pub struct Script {
    config: Arc<HarnessConfig>,
    ctx: Arc<ExecutionContext>,
    runner: CommandRunner,
    actions: Vec<String>,
}

impl Script {
    /// Build a script for the named actions, or the configured defaults when
    /// none are named. Every name must exist in the configuration.
    pub fn new(config: HarnessConfig, sink: Arc<dyn LogSink>, actions: Vec<String>) -> Result<Self> {
        let actions = if actions.is_empty() {
            config.default_actions.clone()
        } else {
            actions
        };

        if let Some(unknown) = actions.iter().find(|a| !config.actions.contains_key(*a)) {
            return Err(HarnessError::Config(format!("Unknown action '{}'", unknown)));
        }

        let ctx = Arc::new(ExecutionContext::from_config(&config, sink));
        Ok(Self {
            runner: CommandRunner::new(Arc::clone(&ctx)),
            config: Arc::new(config),
            ctx,
            actions,
        })
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Write the effective configuration as JSON, keeping one backup
    pub fn dump_config(&self) -> Result<PathBuf> {
        let path = self.config.log_dir.join(LOCAL_CONFIG);
        fs::create_dir_all(&self.config.log_dir)?;

        if path.exists() {
            let backup = self.config.log_dir.join(format!("{}.bak", LOCAL_CONFIG));
            fs::rename(&path, &backup)?;
        }

        let contents = serde_json::to_string_pretty(self.config.as_ref())?;
        fs::write(&path, contents)?;
        self.ctx
            .sink()
            .info(&format!("Wrote effective configuration to {}", path.display()));
        Ok(path)
    }

    /// Run every action in order
    ///
    /// Failed actions are recorded and the script moves on. A halt ends the
    /// script at once; the summary is replayed before the halt is returned.
    pub async fn run(&self) -> Result<ScriptReport> {
        if self.config.dump_config {
            self.dump_config()?;
        }

        self.ctx
            .sink()
            .info(&format!("Actions: {}", self.actions.join(", ")));

        let mut report = ScriptReport::default();

        for name in &self.actions {
            self.ctx.action_message(&format!("Running action {}", name));

            match self.run_action(name).await {
                Ok(true) => report.completed.push(name.clone()),
                Ok(false) => {
                    self.ctx
                        .add_summary(format!("Action {} failed", name), Level::Error);
                    report.failed.push(name.clone());
                }
                Err(e) if e.halt().is_some() => {
                    self.ctx
                        .add_summary(format!("Action {} halted: {}", name, e), Level::Critical);
                    self.ctx.summary("harness");
                    return Err(e);
                }
                Err(e) => {
                    self.ctx
                        .add_summary(format!("Action {} failed: {}", name, e), Level::Error);
                    report.failed.push(name.clone());
                }
            }
        }

        self.ctx.summary("harness");
        Ok(report)
    }

    /// Run one action; `Ok(false)` means it failed without halting
    async fn run_action(&self, name: &str) -> Result<bool> {
        let step = self
            .config
            .actions
            .get(name)
            .ok_or_else(|| HarnessError::Config(format!("Unknown action '{}'", name)))?;

        match step {
            ActionStep::Run(run) => {
                let request = self.build_request(run)?;
                let result = self.runner.run(&request).await?;
                debug!("Action {} finished: {:?}", name, result);

                let value = match result.value(request.kind()) {
                    ResultValue::Status(code) => format!("exit code {}", code),
                    ResultValue::Output(output) => format!("{} bytes of output", output.len()),
                    ResultValue::ErrorCount(count) => format!("{} errors", count),
                };
                // Failed starts come back as `Failed`, so `NotRun` only means dry run
                let succeeded = matches!(result.outcome, Outcome::Success | Outcome::NotRun);
                if succeeded {
                    self.ctx
                        .add_summary(format!("Action {}: {}", name, value), Level::Info);
                }
                Ok(succeeded)
            }
            ActionStep::Clobber { paths } => {
                for path in paths {
                    self.ctx.rmtree(&self.config.resolve(path))?;
                }
                Ok(true)
            }
            ActionStep::Mkdir { paths } => {
                for path in paths {
                    self.ctx.mkdir_p(&self.config.resolve(path))?;
                }
                Ok(true)
            }
        }
    }

    /// Turn a configured step into a request, compiling its rule set
    pub fn build_request(&self, step: &RunStep) -> Result<ExecutionRequest> {
        let mut command = Command::new(step.command.clone()).envs(step.env.clone());
        if let Some(shell) = step.shell {
            command = command.shell(shell);
        }
        command = match &step.cwd {
            Some(cwd) => command.current_dir(self.config.resolve(cwd)),
            None => command.current_dir(&self.config.work_dir),
        };

        let rules = match &step.rules {
            Some(name) => compile_rules(&self.config.rule_set(name)?, self.ctx.sink()),
            None => Vec::new(),
        };

        let mut request = ExecutionRequest::new(command)
            .rules(rules)
            .halt_on_failure(step.halt_on_failure)
            .result_kind(step.result)
            .silent(step.silent);
        if let Some(codes) = &step.success_codes {
            request = request.success_codes(codes.iter().copied());
        }
        Ok(request)
    }
}

/// First log line of a run: how the harness was invoked and where
pub fn run_header(args: &[String]) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown host".to_string());
    format!("Run as {} on {}", shell_words::join(args), host)
}
