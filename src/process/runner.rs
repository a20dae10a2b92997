use std::process::Stdio;
use std::sync::Arc;

use log::debug;
use tokio::process::Child;

use crate::context::ExecutionContext;
use crate::process::collector::{CaptureFiles, OutputCollector, OutputPipe, RunState};
use crate::process::{
    ExecutionRequest, ExecutionResult, HaltCause, HaltReport, Outcome, ProcessError,
    ProcessResult, ResultKind, ResultValue, NOT_RUN,
};
use crate::sink::Level;

/// Runs commands and applies the halt policy to their outcome
///
/// Each call to [`CommandRunner::run`] is independent: the child process and
/// its tally live only for the duration of that call.
#[derive(Clone)]
pub struct CommandRunner {
    ctx: Arc<ExecutionContext>,
}

impl CommandRunner {
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Run a request and return the value its result kind selects
    pub async fn run_value(&self, request: &ExecutionRequest) -> ProcessResult<ResultValue> {
        let result = self.run(request).await?;
        Ok(result.value(request.kind()))
    }

    /// Run a request
    ///
    /// Returns `Err(ProcessError::Halt)` when a fatal rule matched or when
    /// `halt_on_failure` was requested and the command failed. Missing
    /// working directories and commands that cannot be started come back as
    /// an ordinary result with exit code [`NOT_RUN`].
    pub async fn run(&self, request: &ExecutionRequest) -> ProcessResult<ExecutionResult> {
        let sink = self.ctx.sink();
        let command = request.command();
        let display = command.display();
        let verb = match request.kind() {
            ResultKind::Output => "Getting output from command",
            _ => "Running command",
        };

        match command.dir() {
            Some(dir) if !dir.is_dir() => {
                sink.error(&format!(
                    "Can't run command {} in non-existent directory {}!",
                    display,
                    dir.display()
                ));
                return Ok(ExecutionResult::not_run(Outcome::Failed));
            }
            Some(dir) => sink.info(&format!("{}: {} in {}", verb, display, dir.display())),
            None => sink.info(&format!("{}: {}", verb, display)),
        }

        if self.ctx.is_dry_run() {
            sink.info("(Dry run; skipping)");
            return Ok(ExecutionResult::not_run(Outcome::NotRun));
        }

        match request.kind() {
            ResultKind::Output => self.run_captured(request).await,
            ResultKind::Status | ResultKind::ErrorCount => self.run_streaming(request).await,
        }
    }

    async fn run_streaming(&self, request: &ExecutionRequest) -> ProcessResult<ExecutionResult> {
        let (pipe, stdout, stderr) = OutputPipe::create()?;
        let Some(mut child) = self.spawn(request, stdout, stderr)? else {
            return Ok(ExecutionResult::not_run(Outcome::Failed));
        };
        let lines = pipe.lines(&mut child)?;

        let mut state = RunState::new(child);
        let mut collector = OutputCollector::new(&self.ctx, request.error_rules());

        if let Some(exit_code) = collector.stream(&mut state, lines).await? {
            if let Err(e) = state.child.kill().await {
                debug!("Failed to kill halted process: {}", e);
            }
            let message = format!(
                "Fatal error rule matched while running {}",
                request.command().display()
            );
            self.ctx.sink().fatal(&message);
            return Err(ProcessError::Halt(HaltReport {
                cause: HaltCause::FatalLine,
                message,
                exit_code,
                result: ExecutionResult {
                    exit_code,
                    error_count: state.error_count,
                    output: None,
                    outcome: Outcome::Halted,
                },
            }));
        }

        let status = state.child.wait().await.map_err(ProcessError::WaitError)?;
        let exit_code = status.code().unwrap_or(NOT_RUN);

        self.decide(request, exit_code, state.error_count, None, false)
    }

    async fn run_captured(&self, request: &ExecutionRequest) -> ProcessResult<ExecutionResult> {
        let files = CaptureFiles::create()?;
        let (stdout, stderr) = files.stdio()?;

        let Some(mut child) = self.spawn(request, stdout, stderr)? else {
            return Ok(ExecutionResult::not_run(Outcome::Failed));
        };
        self.ctx
            .sink()
            .debug(&format!("Temporary files: {}", files.describe()));

        let status = child.wait().await.map_err(ProcessError::WaitError)?;
        let exit_code = status.code().unwrap_or(NOT_RUN);

        let captured = files.collect(self.ctx.sink(), request.is_silent()).await?;

        self.decide(request, exit_code, 0, Some(captured.output), captured.stderr_seen)
    }

    /// Start the child, or log why it couldn't be started
    fn spawn(
        &self,
        request: &ExecutionRequest,
        stdout: Stdio,
        stderr: Stdio,
    ) -> ProcessResult<Option<Child>> {
        let command = request.command();
        let spawned = command
            .to_tokio(stdout, stderr)
            .and_then(|mut cmd| cmd.spawn().map_err(ProcessError::SpawnError));

        match spawned {
            Ok(child) => Ok(Some(child)),
            Err(ProcessError::InvalidCommand(reason)) => {
                self.ctx.sink().error(&format!("Invalid command: {}", reason));
                Ok(None)
            }
            Err(ProcessError::SpawnError(e)) => {
                self.ctx
                    .sink()
                    .error(&format!("Failed to start {}: {}", command.display(), e));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Turn the exit code and tally into an outcome, halting if required
    fn decide(
        &self,
        request: &ExecutionRequest,
        exit_code: i32,
        error_count: usize,
        output: Option<String>,
        stderr_seen: bool,
    ) -> ProcessResult<ExecutionResult> {
        let accepted = request
            .accepted_codes()
            .unwrap_or_else(|| self.ctx.default_success_codes())
            .contains(&exit_code);
        let success =
            accepted && !stderr_seen && (!request.halts_on_failure() || error_count == 0);

        let level = if success { Level::Info } else { Level::Error };
        self.ctx
            .sink()
            .log(level, &format!("Return code: {}", exit_code));

        let mut result = ExecutionResult {
            exit_code,
            error_count,
            output,
            outcome: if success {
                Outcome::Success
            } else {
                Outcome::Failed
            },
        };

        if request.halts_on_failure() && !success {
            result.outcome = Outcome::Halted;
            let message = format!(
                "Halting on failure while running {}",
                request.command().display()
            );
            self.ctx.sink().fatal(&message);
            return Err(ProcessError::Halt(HaltReport {
                cause: HaltCause::Failure,
                message,
                exit_code,
                result,
            }));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Command, ContextLines, ErrorRule};
    use crate::sink::RecordingSink;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn runner(dry_run: bool) -> (CommandRunner, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let ctx = ExecutionContext::new(sink.clone())
            .dry_run(dry_run)
            .poll_interval(Duration::from_millis(10))
            .drain_grace(Duration::from_millis(200));
        (CommandRunner::new(Arc::new(ctx)), sink)
    }

    fn halt_of(err: ProcessError) -> HaltReport {
        match err {
            ProcessError::Halt(report) => report,
            other => panic!("expected a halt, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new("echo hello"));

        let result = runner.run(&request).await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.error_count, 0);
        assert_eq!(result.outcome, Outcome::Success);
        assert!(sink.contains(Level::Info, " hello"));
        assert!(sink.contains(Level::Info, "Return code: 0"));
    }

    #[tokio::test]
    async fn test_tally_without_halt_still_succeeds() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new(
            "echo 'Error: one'; echo fine; echo 'CRIT two' 1>&2; echo 'careful'",
        ))
        .rules(vec![
            ErrorRule::substring("Error:", Level::Error),
            ErrorRule::substring("CRIT", Level::Critical),
            ErrorRule::substring("careful", Level::Warning),
        ])
        .result_kind(ResultKind::ErrorCount);

        let value = runner.run_value(&request).await.unwrap();

        assert_eq!(value, ResultValue::ErrorCount(2));
        assert!(sink.contains(Level::Critical, "CRIT two"));
        assert!(sink.contains(Level::Warning, "careful"));
    }

    #[tokio::test]
    async fn test_unaccepted_exit_code_is_failure() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new("exit 3"));

        let result = runner.run(&request).await.unwrap();

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(sink.contains(Level::Error, "Return code: 3"));

        let request = request.success_codes([0, 3]);
        let result = runner.run(&request).await.unwrap();
        assert_eq!(result.outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_halt_on_matched_error() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new("echo 'Error: disk full'; exit 0"))
            .rules(vec![ErrorRule::substring("Error:", Level::Error)])
            .halt_on_failure(true);

        let report = halt_of(runner.run(&request).await.unwrap_err());

        assert_eq!(report.cause, HaltCause::Failure);
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.result.error_count, 1);
        assert_eq!(report.result.outcome, Outcome::Halted);
        assert!(sink.contains(Level::Fatal, "Halting on failure"));
    }

    #[tokio::test]
    async fn test_halt_uses_command_exit_code() {
        let (runner, _) = runner(false);
        let request = ExecutionRequest::new(Command::new("exit 4")).halt_on_failure(true);

        let report = halt_of(runner.run(&request).await.unwrap_err());
        assert_eq!(report.exit_code, 4);
    }

    #[tokio::test]
    async fn test_fatal_line_stops_immediately() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new("echo FATAL_TOKEN; sleep 30; exit 0"))
            .rules(vec![ErrorRule::substring("FATAL_TOKEN", Level::Fatal)]);

        let started = Instant::now();
        let report = halt_of(runner.run(&request).await.unwrap_err());

        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(report.cause, HaltCause::FatalLine);
        assert_eq!(report.exit_code, -1);
        assert_eq!(report.result.error_count, 1);
        assert!(sink.contains(Level::Fatal, " FATAL_TOKEN"));
    }

    #[tokio::test]
    async fn test_missing_cwd_is_not_run() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new("echo hi").current_dir("/does/not/exist"))
            .halt_on_failure(true);

        let result = runner.run(&request).await.unwrap();

        assert_eq!(result.exit_code, NOT_RUN);
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(sink.contains(Level::Error, "non-existent directory /does/not/exist"));
        assert!(!sink.contains(Level::Info, " hi"));
    }

    #[tokio::test]
    async fn test_dry_run_never_spawns() {
        let (runner, sink) = runner(true);
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("marker");
        let request = ExecutionRequest::new(Command::new(format!("touch {}", marker.display())))
            .rules(vec![ErrorRule::substring("", Level::Fatal)])
            .halt_on_failure(true);

        let result = runner.run(&request).await.unwrap();

        assert_eq!(result.exit_code, NOT_RUN);
        assert_eq!(result.outcome, Outcome::NotRun);
        assert!(!marker.exists());
        assert!(sink.contains(Level::Info, "(Dry run; skipping)"));

        let request = request.result_kind(ResultKind::Output);
        assert_eq!(runner.run(&request).await.unwrap().exit_code, NOT_RUN);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_unknown_program_is_not_run() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new(vec!["definitely-not-a-real-binary-xyz"]));

        let result = runner.run(&request).await.unwrap();

        assert_eq!(result.exit_code, NOT_RUN);
        assert!(sink.contains(Level::Error, "Failed to start"));
    }

    #[tokio::test]
    async fn test_runs_in_working_directory_with_env() {
        let (runner, sink) = runner(false);
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("present.txt"), "").unwrap();
        let request = ExecutionRequest::new(
            Command::new("ls; echo \"value=$HARNESS_TEST_VAR\"")
                .current_dir(dir.path())
                .env("HARNESS_TEST_VAR", "42"),
        );

        runner.run(&request).await.unwrap();

        assert!(sink.contains(Level::Info, " present.txt"));
        assert!(sink.contains(Level::Info, " value=42"));
    }

    #[tokio::test]
    async fn test_trailing_output_is_not_lost() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new(
            "for i in 1 2 3 4 5; do echo line$i; done; printf 'last-without-newline'",
        ));

        runner.run(&request).await.unwrap();

        for i in 1..=5 {
            assert!(sink.contains(Level::Info, &format!(" line{}", i)));
        }
        assert!(sink.contains(Level::Info, " last-without-newline"));
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_keep_write_order() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new(
            "i=1; while [ $i -le 300 ]; do echo o$i; echo e$i 1>&2; i=$((i+1)); done",
        ));

        runner.run(&request).await.unwrap();

        let lines: Vec<String> = sink
            .messages_at(Level::Info)
            .into_iter()
            .filter(|m| m.starts_with(' '))
            .collect();
        let expected: Vec<String> = (1..=300)
            .flat_map(|i| [format!(" o{}", i), format!(" e{}", i)])
            .collect();
        assert_eq!(lines, expected);
    }

    #[tokio::test]
    async fn test_leading_context_is_the_previous_written_line() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new(
            "i=1; while [ $i -le 50 ]; do echo ctx$i 1>&2; echo Error:$i; i=$((i+1)); done",
        ))
        .rules(vec![ErrorRule::substring("Error:", Level::Error)
            .with_context(ContextLines { before: 1, after: 0 })]);

        let result = runner.run(&request).await.unwrap();

        assert_eq!(result.error_count, 50);
        let expected: Vec<String> = (1..=50)
            .flat_map(|i| [format!(" ctx{}", i), format!(" Error:{}", i)])
            .collect();
        assert_eq!(sink.messages_at(Level::Error), expected);
    }

    #[tokio::test]
    async fn test_orphan_holding_output_is_cut_off_after_grace() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new("sleep 20 & echo hi"));

        let started = Instant::now();
        let result = runner.run(&request).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.exit_code, 0);
        assert!(sink.contains(Level::Info, " hi"));
        assert!(sink.contains(Level::Warning, "output is still open"));
    }

    #[tokio::test]
    async fn test_silent_process_is_waited_for() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new("sleep 1; echo late"));

        let started = Instant::now();
        let result = runner.run(&request).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(900));
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.outcome, Outcome::Success);
        assert!(sink.contains(Level::Info, " late"));
        assert!(!sink.contains(Level::Warning, "output is still open"));
    }

    #[tokio::test]
    async fn test_captured_output() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new("printf 'alpha\\n\\nbeta\\n\\n\\n'"))
            .result_kind(ResultKind::Output);

        let result = runner.run(&request).await.unwrap();

        assert_eq!(result.output.as_deref(), Some("alpha\n\nbeta"));
        assert_eq!(result.outcome, Outcome::Success);
        assert!(sink.contains(Level::Info, "Output received:"));
        assert!(sink.contains(Level::Info, "Return code: 0"));
    }

    #[tokio::test]
    async fn test_captured_stderr_forces_failure() {
        let (runner, sink) = runner(false);
        let request = ExecutionRequest::new(Command::new("echo out; echo oops 1>&2"))
            .result_kind(ResultKind::Output)
            .silent(true);

        let result = runner.run(&request).await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.value(ResultKind::Output), ResultValue::Output("out".into()));
        assert!(!sink.contains(Level::Info, "Output received:"));
        assert!(sink.contains(Level::Error, " oops"));
        assert!(sink.contains(Level::Error, "Return code: 0"));
    }

    #[tokio::test]
    async fn test_captured_halt_on_failure() {
        let (runner, _) = runner(false);
        let request = ExecutionRequest::new(Command::new("echo oops 1>&2; exit 2"))
            .result_kind(ResultKind::Output)
            .halt_on_failure(true);

        let report = halt_of(runner.run(&request).await.unwrap_err());
        assert_eq!(report.exit_code, 2);
        assert_eq!(report.result.output.as_deref(), Some(""));
    }
}
