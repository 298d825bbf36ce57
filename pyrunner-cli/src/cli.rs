//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute Python code once and print its output
    Run {
        /// Python source file, or '-' to read from stdin
        #[arg(value_name = "FILE", conflicts_with = "code")]
        file: Option<PathBuf>,

        /// Python source passed inline
        #[arg(long, value_name = "SOURCE")]
        code: Option<String>,

        /// Directory receiving plots and downloaded files
        #[arg(long, value_name = "PATH")]
        output_dir: Option<PathBuf>,

        /// Stop the execution after this many seconds
        #[arg(long, value_name = "SECONDS")]
        timeout: Option<u64>,

        /// Print every update as one JSON object per line
        #[arg(long)]
        json: bool,
    },

    /// Start the interpreter and report its version and packages
    Check,

    /// Serve executions over stdin/stdout, one JSON envelope per line
    Serve,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print a sample configuration with every default filled in
    Sample,

    /// Show the effective configuration, environment overrides included
    Show {
        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}
