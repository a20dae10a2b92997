use std::collections::VecDeque;
use std::fs::File;
use std::io;
#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::time::Instant;

use log::{debug, trace};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader, Split};
#[cfg(unix)]
use tokio::net::unix::pipe;
use tokio::process::Child;
#[cfg(not(unix))]
use tokio::process::{ChildStderr, ChildStdout};
use tokio::time::{interval, MissedTickBehavior};

use crate::context::ExecutionContext;
use crate::process::{match_line, ErrorRule, ProcessError, ProcessResult};
use crate::sink::{Level, LogSink};

/// Per-invocation state, owned by the runner and dropped when it returns
pub(crate) struct RunState {
    pub(crate) child: Child,
    pub(crate) error_count: usize,
    pub(crate) still_running: bool,
}

impl RunState {
    pub(crate) fn new(child: Child) -> Self {
        Self {
            child,
            error_count: 0,
            still_running: true,
        }
    }
}

/// Feeds process output through the error rules and logs every line
pub struct OutputCollector<'a> {
    ctx: &'a ExecutionContext,
    rules: &'a [ErrorRule],
    /// Recently seen lines, kept for rules that emit leading context
    recent: VecDeque<String>,
    keep: usize,
    /// Level and remaining count for trailing context after a match
    trailing: Option<(Level, usize)>,
}

impl<'a> OutputCollector<'a> {
    pub fn new(ctx: &'a ExecutionContext, rules: &'a [ErrorRule]) -> Self {
        let keep = rules.iter().map(|r| r.context().before).max().unwrap_or(0);
        Self {
            ctx,
            rules,
            recent: VecDeque::with_capacity(keep),
            keep,
            trailing: None,
        }
    }

    /// Classify and log one raw line of output
    ///
    /// Returns the exit code to halt with if the line matched a fatal rule.
    pub fn feed(&mut self, raw: &[u8], error_count: &mut usize) -> Option<i32> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end();
        if line.trim().is_empty() {
            return None;
        }

        let ctx = self.ctx;
        let sink = ctx.sink();
        let rules = self.rules;
        let mut fatal = None;

        match match_line(line, rules) {
            Some(rule) => {
                let level = rule.level();
                let context = rule.context();

                let skip = self.recent.len().saturating_sub(context.before);
                for previous in self.recent.iter().skip(skip) {
                    sink.log(level, &format!(" {}", previous));
                }

                sink.log(level, &format!(" {}", line));
                if level.is_error() {
                    *error_count += 1;
                }
                if level == Level::Fatal {
                    fatal = Some(rule.fatal_exit_code());
                }

                self.trailing = (context.after > 0).then_some((level, context.after));
            }
            None => match self.trailing.take() {
                Some((level, remaining)) => {
                    sink.log(level, &format!(" {}", line));
                    if remaining > 1 {
                        self.trailing = Some((level, remaining - 1));
                    }
                }
                None => sink.info(&format!(" {}", line)),
            },
        }

        if self.keep > 0 {
            if self.recent.len() == self.keep {
                self.recent.pop_front();
            }
            self.recent.push_back(line.to_string());
        }

        fatal
    }

    /// Drain the combined output of a running process
    ///
    /// Lines are read until EOF while the process is polled for exit on a
    /// fixed interval. If the process has exited but something keeps its
    /// output open past the drain grace period, draining stops. Returns the
    /// fatal exit code if a fatal rule matched; the child is left for the
    /// caller to reap.
    pub(crate) async fn stream(
        &mut self,
        state: &mut RunState,
        mut lines: OutputLines,
    ) -> ProcessResult<Option<i32>> {
        let mut ticker = interval(self.ctx.poll_every());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut exited_at: Option<Instant> = None;

        loop {
            tokio::select! {
                segment = lines.next_line() => {
                    match segment.map_err(ProcessError::ReadError)? {
                        Some(bytes) => {
                            if let Some(code) = self.feed(&bytes, &mut state.error_count) {
                                return Ok(Some(code));
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if state.still_running {
                        if state.child.try_wait().map_err(ProcessError::WaitError)?.is_some() {
                            trace!("Process exited; draining remaining output");
                            state.still_running = false;
                            exited_at = Some(Instant::now());
                        }
                    } else if let Some(at) = exited_at {
                        if at.elapsed() >= self.ctx.grace() {
                            self.ctx.sink().warning(
                                "Process exited but its output is still open; stopped reading",
                            );
                            break;
                        }
                    }
                }
            }
        }

        Ok(None)
    }
}

/// One pipe carrying both stdout and stderr of a child, in write order
pub(crate) struct OutputPipe {
    #[cfg(unix)]
    receiver: pipe::Receiver,
}

impl OutputPipe {
    /// Create the pipe, along with the handles to give the child as its
    /// stdout and stderr
    #[cfg(unix)]
    pub(crate) fn create() -> ProcessResult<(Self, Stdio, Stdio)> {
        let (sender, receiver) = pipe::pipe().map_err(ProcessError::PipeError)?;
        let stdout: OwnedFd = sender.into_blocking_fd().map_err(ProcessError::PipeError)?;
        let stderr = stdout.try_clone().map_err(ProcessError::PipeError)?;
        Ok((Self { receiver }, Stdio::from(stdout), Stdio::from(stderr)))
    }

    /// Without unix pipes the child gets two pipes, merged as lines arrive
    #[cfg(not(unix))]
    pub(crate) fn create() -> ProcessResult<(Self, Stdio, Stdio)> {
        Ok((Self {}, Stdio::piped(), Stdio::piped()))
    }

    /// Start reading lines once the child is running
    #[cfg(unix)]
    pub(crate) fn lines(self, _child: &mut Child) -> ProcessResult<OutputLines> {
        Ok(OutputLines {
            merged: BufReader::new(self.receiver).split(b'\n'),
        })
    }

    #[cfg(not(unix))]
    pub(crate) fn lines(self, child: &mut Child) -> ProcessResult<OutputLines> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::InvalidCommand("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessError::InvalidCommand("stderr not captured".to_string()))?;
        Ok(OutputLines {
            stdout: Some(BufReader::new(stdout).split(b'\n')),
            stderr: Some(BufReader::new(stderr).split(b'\n')),
        })
    }
}

/// Raw lines of a child's combined output
pub(crate) struct OutputLines {
    #[cfg(unix)]
    merged: Split<BufReader<pipe::Receiver>>,
    #[cfg(not(unix))]
    stdout: Option<Split<BufReader<ChildStdout>>>,
    #[cfg(not(unix))]
    stderr: Option<Split<BufReader<ChildStderr>>>,
}

impl OutputLines {
    /// Next line without its newline, or `None` once the output is closed
    #[cfg(unix)]
    async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.merged.next_segment().await
    }

    #[cfg(not(unix))]
    async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            let segment = match (self.stdout.as_mut(), self.stderr.as_mut()) {
                (None, None) => return Ok(None),
                (Some(out), None) => (out.next_segment().await, true),
                (None, Some(err)) => (err.next_segment().await, false),
                (Some(out), Some(err)) => tokio::select! {
                    segment = out.next_segment() => (segment, true),
                    segment = err.next_segment() => (segment, false),
                },
            };
            match segment {
                (Ok(None), true) => self.stdout = None,
                (Ok(None), false) => self.stderr = None,
                (result, _) => return result,
            }
        }
    }
}

/// Captured output of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    /// Standard output, trailing whitespace removed, lines joined with `\n`
    pub output: String,
    /// Whether anything was written to standard error
    pub stderr_seen: bool,
}

/// Temporary files receiving a process's stdout and stderr
///
/// Both files are removed when this value is dropped, whichever way the
/// invocation ends.
pub struct CaptureFiles {
    stdout: NamedTempFile,
    stderr: NamedTempFile,
}

impl CaptureFiles {
    pub fn create() -> ProcessResult<Self> {
        let stdout = tempfile::Builder::new()
            .suffix("stdout")
            .tempfile()
            .map_err(ProcessError::TempFile)?;
        let stderr = tempfile::Builder::new()
            .suffix("stderr")
            .tempfile()
            .map_err(ProcessError::TempFile)?;
        Ok(Self { stdout, stderr })
    }

    /// Handles to give to the child as its stdout and stderr
    pub fn stdio(&self) -> ProcessResult<(Stdio, Stdio)> {
        let out: File = self.stdout.as_file().try_clone().map_err(ProcessError::TempFile)?;
        let err: File = self.stderr.as_file().try_clone().map_err(ProcessError::TempFile)?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }

    pub fn describe(&self) -> String {
        format!(
            "{} and {}",
            self.stdout.path().display(),
            self.stderr.path().display()
        )
    }

    /// Read both files, log their contents, and remove them
    pub async fn collect(self, sink: &dyn LogSink, silent: bool) -> ProcessResult<Captured> {
        let stdout = tokio::fs::read(self.stdout.path())
            .await
            .map_err(ProcessError::TempFile)?;
        let stderr = tokio::fs::read(self.stderr.path())
            .await
            .map_err(ProcessError::TempFile)?;

        let stdout = String::from_utf8_lossy(&stdout);
        let lines: Vec<&str> = stdout.trim_end().lines().collect();
        if !stdout.is_empty() && !silent {
            sink.info("Output received:");
            for line in lines.iter().filter(|l| !l.trim().is_empty()) {
                sink.info(&format!(" {}", line));
            }
        }

        let stderr_seen = !stderr.is_empty();
        if stderr_seen {
            sink.error("Errors received:");
            let stderr = String::from_utf8_lossy(&stderr);
            for line in stderr.trim_end().lines().filter(|l| !l.trim().is_empty()) {
                sink.error(&format!(" {}", line));
            }
        }

        let output = lines.join("\n");

        if let Err(e) = self.stdout.close() {
            debug!("Failed to remove temporary stdout file: {}", e);
        }
        if let Err(e) = self.stderr.close() {
            debug!("Failed to remove temporary stderr file: {}", e);
        }

        Ok(Captured {
            output,
            stderr_seen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ContextLines;
    use crate::sink::RecordingSink;
    use std::sync::Arc;

    fn context() -> (ExecutionContext, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (ExecutionContext::new(sink.clone()), sink)
    }

    #[test]
    fn test_feed_tallies_error_levels_only() {
        let (ctx, sink) = context();
        let rules = vec![
            ErrorRule::substring("warn", Level::Warning),
            ErrorRule::substring("Error:", Level::Error),
            ErrorRule::substring("CRIT", Level::Critical),
            ErrorRule::substring("noise", Level::Ignore),
        ];
        let mut collector = OutputCollector::new(&ctx, &rules);
        let mut count = 0;

        for line in ["hello\n", "warn me", "Error: x", "CRIT y", "noise", "   ", ""] {
            assert_eq!(collector.feed(line.as_bytes(), &mut count), None);
        }

        assert_eq!(count, 2);
        assert_eq!(
            sink.records(),
            vec![
                (Level::Info, " hello".to_string()),
                (Level::Warning, " warn me".to_string()),
                (Level::Error, " Error: x".to_string()),
                (Level::Critical, " CRIT y".to_string()),
            ]
        );
    }

    #[test]
    fn test_feed_reports_fatal_exit_code() {
        let (ctx, sink) = context();
        let rules = vec![ErrorRule::substring("FATAL_TOKEN", Level::Fatal).with_exit_code(7)];
        let mut collector = OutputCollector::new(&ctx, &rules);
        let mut count = 0;

        assert_eq!(collector.feed(b"FATAL_TOKEN\r\n", &mut count), Some(7));
        assert_eq!(count, 1);
        assert!(sink.contains(Level::Fatal, "FATAL_TOKEN"));
    }

    #[test]
    fn test_feed_decodes_lossily() {
        let (ctx, sink) = context();
        let mut collector = OutputCollector::new(&ctx, &[]);
        let mut count = 0;

        collector.feed(b"caf\xe9 ok", &mut count);
        assert!(sink.contains(Level::Info, "ok"));
    }

    #[test]
    fn test_context_lines_follow_match_level() {
        let (ctx, sink) = context();
        let rules = vec![ErrorRule::substring("Error:", Level::Error)
            .with_context(ContextLines { before: 1, after: 2 })];
        let mut collector = OutputCollector::new(&ctx, &rules);
        let mut count = 0;

        for line in ["one", "two", "Error: boom", "three", "four", "five"] {
            collector.feed(line.as_bytes(), &mut count);
        }

        assert_eq!(count, 1);
        assert_eq!(
            sink.messages_at(Level::Error),
            vec![" two", " Error: boom", " three", " four"]
        );
        assert_eq!(sink.messages_at(Level::Info), vec![" one", " two", " five"]);
    }

    #[tokio::test]
    async fn test_capture_files_are_removed() {
        let (_, sink) = context();
        let files = CaptureFiles::create().unwrap();
        let stdout_path = files.stdout.path().to_path_buf();
        let stderr_path = files.stderr.path().to_path_buf();

        std::fs::write(&stdout_path, "a\n\nb\n\n\n").unwrap();

        let captured = files.collect(sink.as_ref(), false).await.unwrap();

        assert_eq!(captured.output, "a\n\nb");
        assert!(!captured.stderr_seen);
        assert!(!stdout_path.exists());
        assert!(!stderr_path.exists());
        assert_eq!(sink.messages_at(Level::Info), vec!["Output received:", " a", " b"]);
    }

    #[tokio::test]
    async fn test_capture_stderr_is_logged_as_error() {
        let (_, sink) = context();
        let files = CaptureFiles::create().unwrap();
        std::fs::write(files.stderr.path(), "bad thing\n").unwrap();

        let captured = files.collect(sink.as_ref(), true).await.unwrap();

        assert!(captured.stderr_seen);
        assert_eq!(captured.output, "");
        assert_eq!(sink.messages_at(Level::Error), vec!["Errors received:", " bad thing"]);
    }
}
