//! Env Orchestrator
//!
//! Entry point: `plan`, `run`, and `down` over the discovered descriptor.

use clap::{Args, Parser, Subcommand};
use env_orchestrator::config::ConfigResolver;
use env_orchestrator::errors::{render_chain, OrchestratorError, EXIT_TESTS_FAILED};
use env_orchestrator::observability::{init_tracing, LogFormat};
use env_orchestrator::orchestrator::Orchestrator;
use env_orchestrator::process::ProcessRunner;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "env-orchestrator", version, about = "Provision kind clusters for system test flows")]
struct Cli {
    /// Directory to start the upward search for env.yaml (default: cwd).
    #[arg(long, global = true, env = "ENV_ORCHESTRATOR_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, env = "ENV_ORCHESTRATOR_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct FlowArgs {
    /// Flow to use (default: inferred from the working directory, then defaultFlow).
    #[arg(long, env = "ENV_ORCHESTRATOR_FLOW")]
    flow: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the resolved plan as JSON.
    Plan(FlowArgs),
    /// Provision, run the test command, and tear down.
    Run {
        #[command(flatten)]
        flow: FlowArgs,
        /// Test command (overrides suite.command).
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Delete the flow's clusters left behind by an interrupted run.
    Down(FlowArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_format) {
        eprintln!("Failed to initialize logging: {e}");
    }

    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, exit_code = e.exit_code(), "env-orchestrator failed");
            eprintln!("error: {}", render_chain(&e));
            ExitCode::from(e.exit_code())
        }
    }
}

async fn execute(cli: Cli) -> Result<u8, OrchestratorError> {
    let cwd = std::env::current_dir().ok();
    let descriptor = ConfigResolver::new().resolve(cli.config_dir.as_deref())?;
    info!(config = %descriptor.config_path.display(), "Loaded environment descriptor");

    let runner = ProcessRunner::new();
    let orchestrator = Orchestrator::new(&runner, descriptor);

    match cli.command {
        Command::Plan(args) => {
            let plan = orchestrator.plan(args.flow.as_deref(), cwd.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(0)
        }
        Command::Run { flow, command } => {
            let plan = orchestrator.plan(flow.flow.as_deref(), cwd.as_deref())?;
            let report = orchestrator.run(&plan, &command).await?;

            echo(&report.suite.stdout, &report.suite.stderr);
            info!(
                run_id = %report.run_id,
                exit_code = report.suite.exit_code,
                teardown_failures = report.teardown.failures.len(),
                "Run complete"
            );
            Ok(if report.suite.passed() { 0 } else { EXIT_TESTS_FAILED })
        }
        Command::Down(args) => {
            let plan = orchestrator.plan(args.flow.as_deref(), cwd.as_deref())?;
            let report = orchestrator.down(&plan).await;
            info!(
                deleted = report.deleted.len(),
                failed = report.failures.len(),
                "Teardown complete"
            );
            Ok(0)
        }
    }
}

fn echo(stdout: &str, stderr: &str) {
    // Broken pipes on our own streams are not worth failing the run over.
    let _ = std::io::stdout().write_all(stdout.as_bytes());
    let _ = std::io::stderr().write_all(stderr.as_bytes());
}
