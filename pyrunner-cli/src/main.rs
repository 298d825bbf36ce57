use anyhow::{Context, Result};
use clap::Parser;
use pyrunner_config::{ConfigLoader, LogFormat, LoggingConfig, PyrunnerConfig};
use pyrunner_execution::ExecutorService;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands, ConfigCommands};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<PyrunnerConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => loader
            .from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

/// Initialize tracing. Output always goes to stderr so stdout stays free for
/// program output and the serve protocol.
fn init_logging(config: &LoggingConfig, log_level: Option<&String>) -> Result<()> {
    let default_level = config.level.to_string();
    let env_filter = match log_level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| {
            eprintln!(
                "Invalid log level '{}', falling back to '{}'",
                level, default_level
            );
            EnvFilter::new(&default_level)
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level)),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    debug!("Tracing initialized");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    init_logging(&config.logging, cli.log_level.as_ref())?;

    info!("pyrunner {} starting", env!("CARGO_PKG_VERSION"));

    let succeeded = match cli.command {
        Commands::Run {
            file,
            code,
            output_dir,
            timeout,
            json,
        } => {
            let source = commands::run::read_source(file.as_deref(), code).await?;
            let timeout = timeout
                .map(Duration::from_secs)
                .or(config.execution.timeout);
            let options = commands::run::RunOptions {
                output_dir,
                timeout,
                json,
            };
            let executor = ExecutorService::new(config).context("Failed to create executor")?;
            let succeeded = commands::run::execute(&executor, source, &options).await?;
            executor.shutdown(SHUTDOWN_TIMEOUT).await;
            succeeded
        }
        Commands::Check => {
            let executor = ExecutorService::new(config).context("Failed to create executor")?;
            let succeeded = commands::check::check(&executor).await;
            executor.shutdown(SHUTDOWN_TIMEOUT).await;
            succeeded
        }
        Commands::Serve => {
            let executor = ExecutorService::new(config).context("Failed to create executor")?;
            commands::serve::serve(executor.clone()).await?;
            executor.shutdown(SHUTDOWN_TIMEOUT).await;
            true
        }
        Commands::Config { config_cmd } => match config_cmd {
            ConfigCommands::Sample => {
                commands::config::print_sample();
                true
            }
            ConfigCommands::Show { format } => {
                commands::config::show(&config, &format)?;
                true
            }
        },
    };

    if !succeeded {
        warn!("pyrunner finished with errors");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
