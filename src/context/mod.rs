use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::sink::{Level, LogSink};

/// One line of the end-of-run summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    pub level: Level,
    pub message: String,
}

/// Read-only settings and the log sink shared by every command invocation
pub struct ExecutionContext {
    dry_run: bool,
    success_codes: BTreeSet<i32>,
    poll_interval: Duration,
    drain_grace: Duration,
    sink: Arc<dyn LogSink>,
    summary: Mutex<Vec<SummaryEntry>>,
}

impl ExecutionContext {
    /// Create a context with default settings
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            dry_run: false,
            success_codes: BTreeSet::from([0]),
            poll_interval: Duration::from_millis(100),
            drain_grace: Duration::from_secs(5),
            sink,
            summary: Mutex::new(Vec::new()),
        }
    }

    /// Create a context from loaded configuration
    pub fn from_config(config: &HarnessConfig, sink: Arc<dyn LogSink>) -> Self {
        Self::new(sink)
            .dry_run(config.noop)
            .success_codes(config.success_codes.iter().copied())
            .poll_interval(Duration::from_millis(config.poll_interval_ms))
            .drain_grace(Duration::from_millis(config.drain_grace_ms))
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Set the default accepted exit codes; an empty set keeps `{0}`
    pub fn success_codes<I: IntoIterator<Item = i32>>(mut self, codes: I) -> Self {
        let codes: BTreeSet<i32> = codes.into_iter().collect();
        if !codes.is_empty() {
            self.success_codes = codes;
        }
        self
    }

    /// How often the drain loop checks whether the process is still alive
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// How long to keep draining once the process has exited
    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn default_success_codes(&self) -> &BTreeSet<i32> {
        &self.success_codes
    }

    pub fn poll_every(&self) -> Duration {
        self.poll_interval
    }

    pub fn grace(&self) -> Duration {
        self.drain_grace
    }

    pub fn sink(&self) -> &dyn LogSink {
        self.sink.as_ref()
    }

    /// Log a message and keep it for the end-of-run summary
    pub fn add_summary(&self, message: impl Into<String>, level: Level) {
        let message = message.into();
        self.sink.log(level, &message);
        let mut summary = match self.summary.lock() {
            Ok(summary) => summary,
            Err(poisoned) => poisoned.into_inner(),
        };
        summary.push(SummaryEntry { level, message });
    }

    pub fn summary_entries(&self) -> Vec<SummaryEntry> {
        match self.summary.lock() {
            Ok(summary) => summary.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replay the summary under a banner
    pub fn summary(&self, title: &str) {
        self.sink
            .info(&format!("#####\n##### {} summary:\n#####", title));
        for entry in self.summary_entries() {
            self.sink.log(entry.level, &entry.message);
        }
    }

    /// Print a banner around an action message
    pub fn action_message(&self, message: &str) {
        self.sink.info("#############################");
        self.sink.info(message);
        self.sink.info("#############################");
    }

    /// Create a directory and its parents
    pub fn mkdir_p(&self, path: &Path) -> Result<()> {
        self.sink.info(&format!("mkdir: {}", path.display()));
        if path.exists() {
            self.sink.info("Already exists.");
            return Ok(());
        }
        if !self.dry_run {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Remove a file or directory tree
    pub fn rmtree(&self, path: &Path) -> Result<()> {
        self.sink.info(&format!("rmtree: {}", path.display()));
        if !path.exists() {
            self.sink.debug(&format!("{} doesn't exist.", path.display()));
            return Ok(());
        }
        if self.dry_run {
            return Ok(());
        }

        let removed = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };

        if let Err(e) = removed {
            let message = format!("Unable to remove {}: {}", path.display(), e);
            self.sink.error(&message);
            return Err(HarnessError::Action(message));
        }
        if path.exists() {
            let message = format!("Unable to remove {}!", path.display());
            self.sink.error(&message);
            return Err(HarnessError::Action(message));
        }
        Ok(())
    }

    pub fn copy_file(&self, src: &Path, dest: &Path) -> Result<()> {
        self.sink
            .info(&format!("Copying {} to {}", src.display(), dest.display()));
        if !self.dry_run {
            fs::copy(src, dest)?;
        }
        Ok(())
    }

    pub fn move_path(&self, src: &Path, dest: &Path) -> Result<()> {
        self.sink
            .info(&format!("Moving {} to {}", src.display(), dest.display()));
        if !self.dry_run {
            fs::rename(src, dest)?;
        }
        Ok(())
    }
}
