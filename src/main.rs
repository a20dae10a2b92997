use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::debug;

use harness::config::{ConfigBuilder, HarnessConfig, LogLevel};
use harness::context::ExecutionContext;
use harness::error::HarnessError;
use harness::process::{
    compile_rules, Command, CommandLine, CommandRunner, ExecutionRequest, ResultKind,
};
use harness::script::{run_header, Script};
use harness::sink::{LogSink, StdLogSink};
use harness::util::logging;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "harness", version, about = "Build and release automation harness")]
struct Args {
    /// Path to the script configuration (TOML, JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log what would be done without doing it
    #[arg(long, global = true)]
    noop: bool,

    /// Override the configured log level
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the script's actions in order
    Run {
        /// Action to run; repeat to run several. Defaults to `default_actions`.
        #[arg(short, long = "action")]
        actions: Vec<String>,
    },
    /// Run a single command through the error-classifying runner
    Exec {
        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Rule set to classify output with
        #[arg(long)]
        rules: Option<String>,

        /// Halt with the command's exit code on any error or bad exit code
        #[arg(long)]
        halt_on_failure: bool,

        /// Capture standard output instead of streaming it
        #[arg(long)]
        output: bool,

        /// Run the arguments through the system shell
        #[arg(long)]
        shell: bool,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

fn load(args: &Args) -> Result<HarnessConfig> {
    let mut builder = ConfigBuilder::new();
    if let Some(path) = &args.config {
        builder = builder.add_file(path);
    }
    let mut config = builder
        .add_env("HARNESS")
        .build()
        .context("Failed to load configuration")?;

    if args.noop {
        config.noop = true;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    Ok(config)
}

/// Terminate the whole run the way a halt demands
fn terminate(exit_code: i32) -> ! {
    log::logger().flush();
    std::process::exit(exit_code)
}

async fn run_script(
    config: HarnessConfig,
    sink: Arc<dyn LogSink>,
    actions: Vec<String>,
) -> Result<i32, HarnessError> {
    let script = Script::new(config, sink, actions)?;
    let report = script.run().await?;
    Ok(if report.is_success() { 0 } else { 1 })
}

async fn exec(
    config: HarnessConfig,
    sink: Arc<dyn LogSink>,
    request: ExecCommand,
) -> Result<i32, HarnessError> {
    let rules = match &request.rules {
        Some(name) => compile_rules(&config.rule_set(name)?, sink.as_ref()),
        None => Vec::new(),
    };

    let mut command = Command::new(CommandLine::Argv(request.command)).shell(request.shell);
    if let Some(cwd) = request.cwd {
        command = command.current_dir(cwd);
    }

    let kind = if request.output {
        ResultKind::Output
    } else {
        ResultKind::Status
    };
    let request = ExecutionRequest::new(command)
        .rules(rules)
        .halt_on_failure(request.halt_on_failure)
        .result_kind(kind);

    let runner = CommandRunner::new(Arc::new(ExecutionContext::from_config(&config, sink)));
    let result = runner.run(&request).await?;

    if let Some(output) = &result.output {
        println!("{}", output);
    }
    Ok(result.exit_code)
}

/// Arguments of the `exec` subcommand
struct ExecCommand {
    cwd: Option<PathBuf>,
    rules: Option<String>,
    halt_on_failure: bool,
    output: bool,
    shell: bool,
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load(&args)?;

    logging::init(&config).context("Failed to initialize logging")?;
    let sink: Arc<dyn LogSink> = Arc::new(StdLogSink);
    sink.info(&run_header(&std::env::args().collect::<Vec<_>>()));

    let outcome = match args.command {
        Commands::Run { actions } => run_script(config, sink, actions).await,
        Commands::Exec {
            cwd,
            rules,
            halt_on_failure,
            output,
            shell,
            command,
        } => {
            let request = ExecCommand {
                cwd,
                rules,
                halt_on_failure,
                output,
                shell,
                command,
            };
            exec(config, sink, request).await
        }
    };

    match outcome {
        Ok(0) => Ok(()),
        Ok(code) => {
            debug!("Exiting with {}", code);
            terminate(code)
        }
        Err(HarnessError::Halt(report)) => terminate(report.exit_code),
        Err(e) => Err(e.into()),
    }
}
