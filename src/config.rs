use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use crate::error::{HarnessError, Result};
use crate::process::{CommandLine, ResultKind, RuleSpec};

/// Source of configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path (TOML, JSON or YAML, chosen by extension)
    File(PathBuf),
    /// Environment variables with a prefix
    Environment(String),
    /// TOML string
    Toml(String),
    /// Default configuration
    Defaults,
}

/// Logging level
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

/// One step of a harness script
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ActionStep {
    /// Run a command through the error-classifying runner
    Run(RunStep),
    /// Remove files or directories
    Clobber { paths: Vec<PathBuf> },
    /// Create directories
    Mkdir { paths: Vec<PathBuf> },
}

/// Settings for a command step
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RunStep {
    pub command: CommandLine,
    /// Overrides the shell mode implied by the command's shape
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<bool>,
    /// Relative paths are resolved against `work_dir`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Name of a rule set in `rules`, or a built-in set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<String>,
    #[serde(default)]
    pub halt_on_failure: bool,
    /// Overrides the global `success_codes`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_codes: Option<Vec<i32>>,
    #[serde(default)]
    pub result: ResultKind,
    #[serde(default)]
    pub silent: bool,
}

/// Harness configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Log commands and file operations without performing them
    #[serde(default)]
    pub noop: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_name")]
    pub log_name: String,
    #[serde(default = "default_true")]
    pub log_to_console: bool,
    #[serde(default)]
    pub append_to_log: bool,
    /// Write the effective configuration to `<log_dir>/localconfig.json`
    #[serde(default)]
    pub dump_config: bool,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    /// Actions run when none are named on the command line
    #[serde(default)]
    pub default_actions: Vec<String>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionStep>,
    /// Named error rule lists
    #[serde(default)]
    pub rules: BTreeMap<String, Vec<RuleSpec>>,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_name() -> String {
    "harness".to_string()
}

fn default_true() -> bool {
    true
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_drain_grace_ms() -> u64 {
    5_000
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            noop: false,
            log_level: LogLevel::default(),
            log_dir: default_log_dir(),
            log_name: default_log_name(),
            log_to_console: true,
            append_to_log: false,
            dump_config: false,
            work_dir: default_work_dir(),
            success_codes: default_success_codes(),
            poll_interval_ms: default_poll_interval_ms(),
            drain_grace_ms: default_drain_grace_ms(),
            default_actions: Vec::new(),
            actions: BTreeMap::new(),
            rules: BTreeMap::new(),
        }
    }
}

/// Helper function to load configuration from various sources
pub fn load_config<T>(sources: Vec<ConfigSource>) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    let mut builder = config::Config::builder();

    // Later sources override earlier ones
    for source in sources {
        match source {
            ConfigSource::File(path) => {
                if !path.exists() {
                    warn!("Configuration file not found: {}", path.display());
                    return Err(HarnessError::Config(format!(
                        "Configuration file not found: {}",
                        path.display()
                    )));
                }

                let format = file_format(&path)?;
                debug!("Loading configuration from file: {}", path.display());
                builder = builder.add_source(config::File::from(path.as_path()).format(format));
            }
            ConfigSource::Environment(prefix) => {
                debug!("Loading configuration from environment with prefix: {}", prefix);
                builder = builder.add_source(
                    config::Environment::with_prefix(&prefix)
                        .separator("__")
                        .try_parsing(true),
                );
            }
            ConfigSource::Toml(toml_str) => {
                debug!("Loading configuration from TOML string");
                builder = builder.add_source(config::File::from_str(
                    &toml_str,
                    config::FileFormat::Toml,
                ));
            }
            ConfigSource::Defaults => {
                // Defaults come from the Deserialize implementation
                debug!("Using default configuration values");
            }
        }
    }

    let config = builder
        .build()
        .map_err(|e| HarnessError::Config(format!("Failed to build configuration: {}", e)))?;

    let result = config.try_deserialize().map_err(|e| {
        HarnessError::Config(format!("Failed to deserialize configuration: {}", e))
    })?;

    debug!("Configuration loaded successfully: {:?}", result);

    Ok(result)
}

fn file_format(path: &Path) -> Result<config::FileFormat> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "toml" => Ok(config::FileFormat::Toml),
        "json" => Ok(config::FileFormat::Json),
        "yaml" | "yml" => Ok(config::FileFormat::Yaml),
        other => Err(HarnessError::Config(format!(
            "Unsupported config format '{}' for {}",
            other,
            path.display()
        ))),
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    sources: Vec<ConfigSource>,
}

impl ConfigBuilder {
    /// Create a new config builder
    pub fn new() -> Self {
        Self {
            sources: vec![ConfigSource::Defaults],
        }
    }

    /// Add a configuration file source
    pub fn add_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.sources.push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add environment variables
    pub fn add_env(mut self, prefix: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Environment(prefix.into()));
        self
    }

    /// Add TOML string
    pub fn add_toml(mut self, toml: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Toml(toml.into()));
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<HarnessConfig> {
        load_config::<HarnessConfig>(self.sources)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessConfig {
    /// Load from a file, with `HARNESS__*` environment overrides on top
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        ConfigBuilder::new().add_file(path).add_env("HARNESS").build()
    }

    /// Rule records for a named set, falling back to the built-in sets
    pub fn rule_set(&self, name: &str) -> Result<Vec<RuleSpec>> {
        if let Some(specs) = self.rules.get(name) {
            return Ok(specs.clone());
        }
        crate::process::builtin_rules(name)
            .ok_or_else(|| HarnessError::Config(format!("Unknown rule set '{}'", name)))
    }

    /// Resolve a path from the configuration against `work_dir`
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Level;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SCRIPT: &str = r#"
        noop = true
        log_level = "debug"
        success_codes = [0, 1]
        default_actions = ["clobber", "build"]

        [actions.clobber]
        kind = "clobber"
        paths = ["obj", "dist"]

        [actions.build]
        kind = "run"
        command = ["make", "-j4"]
        rules = "make"
        halt_on_failure = true
        result = "error_count"

        [[rules.make]]
        substr = "Error:"
        level = "error"
        context_lines = "5:5"

        [[rules.make]]
        regex = "^make: \\*\\*\\*"
        level = "fatal"
        exit_code = 2
    "#;

    #[test]
    fn test_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.success_codes, vec![0]);
        assert!(config.log_to_console);
    }

    #[test]
    fn test_load_script_from_toml_string() {
        let config = ConfigBuilder::new().add_toml(SCRIPT).build().unwrap();

        assert!(config.noop);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.success_codes, vec![0, 1]);
        assert_eq!(config.default_actions, vec!["clobber", "build"]);

        match &config.actions["build"] {
            ActionStep::Run(step) => {
                assert_eq!(
                    step.command,
                    CommandLine::Argv(vec!["make".into(), "-j4".into()])
                );
                assert!(step.halt_on_failure);
                assert_eq!(step.result, ResultKind::ErrorCount);
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(
            config.actions["clobber"],
            ActionStep::Clobber {
                paths: vec![PathBuf::from("obj"), PathBuf::from("dist")]
            }
        );

        let make = config.rule_set("make").unwrap();
        assert_eq!(make[0].substring.as_deref(), Some("Error:"));
        assert_eq!(make[1].level, Level::Fatal);
        assert_eq!(make[1].exit_code, Some(2));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "log_name = \"talos\"\nwork_dir = \"/srv/build\"").unwrap();

        let config = HarnessConfig::load(file.path()).unwrap();
        assert_eq!(config.log_name, "talos");
        assert_eq!(config.resolve(Path::new("src")), PathBuf::from("/srv/build/src"));
        assert_eq!(config.resolve(Path::new("/abs")), PathBuf::from("/abs"));
    }

    #[test]
    fn test_missing_and_unsupported_files() {
        assert!(matches!(
            HarnessConfig::load("/no/such/file.toml"),
            Err(HarnessError::Config(_))
        ));

        let file = NamedTempFile::new().unwrap();
        assert!(matches!(
            HarnessConfig::load(file.path()),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn test_later_sources_override() {
        let config = ConfigBuilder::new()
            .add_toml("log_name = \"first\"\nnoop = true")
            .add_toml("log_name = \"second\"")
            .build()
            .unwrap();

        assert_eq!(config.log_name, "second");
        assert!(config.noop);
    }

    #[test]
    fn test_rule_set_falls_back_to_builtin() {
        let config = HarnessConfig::default();
        assert_eq!(config.rule_set("hg").unwrap().len(), 3);
        assert!(config.rule_set("missing").is_err());
    }
}
