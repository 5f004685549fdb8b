//! Configuration sourced from the CLI

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
pub struct Cli {
    /// Path to the configuration file in JSON format
    #[arg(long, default_value = "proxy-config.json")]
    pub config: PathBuf,

    /// Validate all configuration data and exit
    #[arg(long)]
    pub validate_configs: bool,

    /// Override the listening port from the configuration file
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the configured log level (ALL, INFO, WARN, ERROR, NONE)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Number of threads used in the worker pool for EACH service
    #[arg(long)]
    pub threads_per_service: Option<usize>,
}
