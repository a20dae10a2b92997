use env_logger::{Builder, Target};
use log::LevelFilter;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use crate::config::{HarnessConfig, LogLevel};
use crate::error::Result;

/// Map the configured level onto a `log` filter
pub fn level_filter(level: &LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    }
}

/// Path of the log file for a configuration
pub fn log_file_path(config: &HarnessConfig) -> PathBuf {
    config.log_dir.join(format!("{}.log", config.log_name))
}

/// Writes every record to a log file and, optionally, to stderr
struct Tee {
    file: File,
    console: bool,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        if self.console {
            io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.console {
            io::stderr().flush()?;
        }
        Ok(())
    }
}

/// Initialize the logging system
///
/// Records go to `<log_dir>/<log_name>.log`, truncated on start unless
/// `append_to_log` is set, and are mirrored to stderr when `log_to_console`.
pub fn init(config: &HarnessConfig) -> Result<()> {
    fs::create_dir_all(&config.log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(config.append_to_log)
        .truncate(!config.append_to_log)
        .open(log_file_path(config))?;

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:>8} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, level_filter(&config.log_level))
        .target(Target::Pipe(Box::new(Tee {
            file,
            console: config.log_to_console,
        })));

    // A logger may already be installed (tests, embedding); keep it
    if builder.try_init().is_err() {
        log::debug!("Logger already initialized");
    }
    Ok(())
}
