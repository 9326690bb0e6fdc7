use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use flowkit::{Engine, EngineError, WorkflowConfig};
use flowkit_bootstrap::{AppConfig, CliArgs, LogBuffer};

mod builtins;

const EXIT_STARTUP_FAILURE: u8 = 1;
const EXIT_CONFIG_INVALID: u8 = 2;
const EXIT_RUNTIME_FATAL: u8 = 3;

/// Flowd - declarative workflow orchestration engine
#[derive(Parser)]
#[command(name = "flowd-server")]
#[command(about = "Flowd - declarative workflow orchestration engine")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to the application configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the workflow document (overrides config)
    #[arg(short, long)]
    workflow: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine
    Run,
    /// Validate the workflow document (build without start) and exit
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        workflow: cli
            .workflow
            .as_ref()
            .map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // Layered config: defaults -> YAML (if provided) -> env (FLOWD__*) ->
    // CLI overrides.
    let mut config = match AppConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e:#}");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };
    config.apply_cli_overrides(&args);

    let log_buffer = LogBuffer::new(1024);
    let logging = config.logging.clone().unwrap_or_default();
    flowkit_bootstrap::init_logging(
        &logging,
        Path::new(&config.server.home_dir),
        Some(log_buffer.clone()),
    );

    if cli.print_config {
        match config.to_yaml() {
            Ok(yaml) => {
                println!("{yaml}");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                eprintln!("failed to render configuration: {e:#}");
                return ExitCode::from(EXIT_CONFIG_INVALID);
            }
        }
    }

    let Some(workflow_path) = config.server.workflow.clone() else {
        eprintln!("no workflow document configured (use --workflow or server.workflow)");
        return ExitCode::from(EXIT_CONFIG_INVALID);
    };

    tracing::info!(workflow = %workflow_path, "Flowd server starting");

    let (workflow, base_dir) = match WorkflowConfig::from_file(&workflow_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(error = %e, "Workflow document is invalid");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    let cancel = CancellationToken::new();
    let opts = builtins::engine_options(log_buffer, base_dir, cancel.clone());

    let engine = match Engine::build_from_config(workflow, opts).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "Engine build failed");
            return ExitCode::from(exit_code_for_build_error(&e));
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => {
            let result = engine.stop().await;
            match result {
                Ok(()) => {
                    tracing::info!("Workflow document is valid");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    tracing::error!(error = %e, "Teardown after check failed");
                    ExitCode::from(EXIT_RUNTIME_FATAL)
                }
            }
        }
        Commands::Run => run_engine(engine, cancel).await,
    }
}

async fn run_engine(engine: Engine, cancel: CancellationToken) -> ExitCode {
    if let Err(e) = engine.start().await {
        tracing::error!(error = %e, "Engine start failed");
        return ExitCode::from(EXIT_STARTUP_FAILURE);
    }
    tracing::info!("Engine started");

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = flowkit_bootstrap::wait_for_shutdown().await {
                tracing::warn!(error = %e, "Signal waiter failed; falling back to ctrl_c()");
                let _ = tokio::signal::ctrl_c().await;
            }
            cancel.cancel();
        });
    }

    engine.wait_for_shutdown().await;
    tracing::info!("Shutting down");

    match engine.stop().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Shutdown finished with errors");
            ExitCode::from(EXIT_RUNTIME_FATAL)
        }
    }
}

/// Validation failures are configuration errors (exit 2); everything else
/// during build is a startup failure (exit 1).
fn exit_code_for_build_error(err: &EngineError) -> u8 {
    match err {
        EngineError::DuplicateModule(_)
        | EngineError::UnknownDependency { .. }
        | EngineError::UnknownType { .. }
        | EngineError::CycleDetected { .. }
        | EngineError::UnclaimedWorkflow(_)
        | EngineError::UnknownTriggerKind(_)
        | EngineError::Config(_) => EXIT_CONFIG_INVALID,
        _ => EXIT_STARTUP_FAILURE,
    }
}
