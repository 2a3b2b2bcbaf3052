use clap::Parser;
use procwarden::config::{ConfigError, RunConfig};
use procwarden::report::{ReportFile, RunReport};
use procwarden::{
    OutputSink, ProcessSupervisor, RunHooks, SupervisorError, TracingDiagnostics,
    KILLED_EXIT_CODE,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// Run a program with its whole process tree under supervision: echo its
/// combined output, kill the tree when it exceeds the overall or output-idle
/// timeout, and exit with its exit code.
#[derive(Parser, Debug)]
#[command(name = "procwarden", version, about)]
pub struct Cli {
    /// Program and arguments (overrides [command] in the config)
    #[arg(value_name = "PROGRAM", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Run file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overall timeout in seconds (overrides config)
    #[arg(short, long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Output idle timeout in seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    output_timeout: Option<f64>,

    /// Track and kill the root process only, not its descendants
    #[arg(long)]
    ignore_children: bool,

    /// Append child output to this file (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Write a JSON run report to this file (overrides config)
    #[arg(long)]
    report: Option<PathBuf>,

    /// Do not echo child output
    #[arg(short, long)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,
}

/// Echoes every child line to stdout.
struct ConsoleHooks {
    echo: bool,
}

impl RunHooks for ConsoleHooks {
    fn on_output_line(&mut self, line: &str) {
        if self.echo {
            println!("{line}");
        }
    }

    fn on_timeout(&mut self) {
        tracing::warn!("process tree killed after timeout");
    }
}

/// Shell convention: 128 + signal for signal deaths.
fn process_exit_status(code: i32) -> u8 {
    if code == KILLED_EXIT_CODE {
        137
    } else if code < 0 {
        (128 - code).clamp(0, 255) as u8
    } else {
        code.clamp(0, 255) as u8
    }
}

fn resolve(cli: &Cli) -> Result<RunConfig, ConfigError> {
    let mut config = match cli.config {
        Some(ref path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };

    if let Some((program, args)) = cli.command.split_first() {
        config.command.program = Some(PathBuf::from(program));
        config.command.args = args.to_vec();
    }
    if cli.ignore_children {
        config.command.track_tree = false;
    }
    if cli.timeout.is_some() {
        config.timeouts.overall_secs = cli.timeout;
    }
    if cli.output_timeout.is_some() {
        config.timeouts.output_idle_secs = cli.output_timeout;
    }
    if cli.log_file.is_some() {
        config.output.log_file = cli.log_file.clone();
    }
    if cli.report.is_some() {
        config.output.report_file = cli.report.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PROCWARDEN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[derive(Debug)]
struct Settings {
    config: RunConfig,
    overall: Option<Duration>,
    idle: Option<Duration>,
    reap: Duration,
}

impl Settings {
    fn new(config: RunConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            overall: config.timeouts.overall()?,
            idle: config.timeouts.output_idle()?,
            reap: config.timeouts.reap()?,
            config,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let settings = match resolve(&cli).and_then(Settings::new) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };
    let request = match settings.config.spawn_request() {
        Ok(request) => request,
        Err(e) => {
            tracing::error!(error = %e, "nothing to run; pass a program after -- or set command.program");
            return ExitCode::from(2);
        }
    };

    if cli.dry_run {
        println!("procwarden v{}", env!("CARGO_PKG_VERSION"));
        println!("program:      {}", request.program.display());
        println!("args:         {:?}", request.args);
        if let Some(ref cwd) = request.cwd {
            println!("cwd:          {}", cwd.display());
        }
        println!("track tree:   {}", request.track_tree);
        println!("timeout:      {:?}", settings.overall);
        println!("idle timeout: {:?}", settings.idle);
        println!("reap timeout: {:?}", settings.reap);
        if let Some(ref log) = settings.config.output.log_file {
            println!("log file:     {}", log.display());
        }
        if let Some(ref report) = settings.config.output.report_file {
            println!("report:       {}", report.display());
        }
        println!("Dry run: config validated, not running.");
        return ExitCode::SUCCESS;
    }

    let mut supervisor = ProcessSupervisor::with_hooks(ConsoleHooks { echo: !cli.quiet })
        .diagnostics(Arc::new(TracingDiagnostics))
        .reap_timeout(settings.reap);

    let started_at = chrono::Utc::now();
    let result = match supervisor.run(&request) {
        Ok(_) => {
            let sink = match settings.config.output.log_file {
                Some(ref path) => OutputSink::File(path.clone()),
                None => OutputSink::None,
            };
            supervisor
                .wait_for_finish(
                    settings.overall,
                    settings.idle,
                    settings.config.output.store,
                    sink,
                )
                .await
        }
        Err(e) => Err(e),
    };

    if let Some(ref path) = settings.config.output.report_file {
        let report = RunReport::from_run(&request.program, &supervisor, started_at);
        if let Err(e) = ReportFile::new(path.clone()).write(&report) {
            tracing::warn!(error = %e, "failed to write run report");
        }
    }

    match result {
        Ok(code) => ExitCode::from(process_exit_status(code)),
        Err(SupervisorError::Spawn(e)) => {
            tracing::error!(error = %e, "failed to start program");
            ExitCode::from(127)
        }
        Err(e) => {
            tracing::error!(error = %e, "supervision failed");
            let code = supervisor.exit_code().map(process_exit_status).unwrap_or(1);
            ExitCode::from(code.max(1))
        }
    }
}
