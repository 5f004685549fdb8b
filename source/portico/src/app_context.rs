use std::sync::Arc;

use clap::Parser;
use miette::{miette, Result};
use pingora::server::Server;
use pingora::services::Service;

use portico_config::cli::Cli;
use portico_config::internal::{Config, LogLevel};
use portico_config::loader::ConfigLoader;

use crate::logging;
use crate::proxy::rate_meter::RateMeter;
use crate::proxy::{portico_proxy_service, ProxyState};

pub struct AppContext {
    state: Arc<ProxyState>,
    server: Server,
}

impl AppContext {
    /// Parse the CLI, load and validate the configuration, and prepare the
    /// server. Returns `None` in `--validate-configs` mode.
    pub async fn bootstrap() -> Result<Option<AppContext>> {
        let cli = Cli::parse();

        let mut config = ConfigLoader.load_file(&cli.config)?;
        apply_cli(&mut config, &cli)?;
        config.validate()?;

        if config.validate_configs {
            println!(
                "configuration OK: {} rule(s), {} referrer entr(ies)",
                config.rules.len(),
                config.referrers.entries.len()
            );
            return Ok(None);
        }

        logging::init(&config.log);
        tracing::info!(config = %cli.config.display(), "configuration loaded");

        let server = Server::new_with_opt_and_conf(config.pingora_opt(), config.pingora_server_conf());

        let state = ProxyState::from_config(config)?;

        Ok(Some(AppContext { state, server }))
    }

    pub fn build_services(&self) -> Result<Vec<Box<dyn Service>>> {
        tracing::info!("Configuring proxy service on {}", self.state.config.listen_addr);
        let service = portico_proxy_service(self.state.clone(), &self.server)?;
        Ok(vec![service])
    }

    pub fn ready(self) -> (Server, Arc<RateMeter>) {
        (self.server, self.state.meter.clone())
    }
}

fn apply_cli(config: &mut Config, cli: &Cli) -> Result<()> {
    config.validate_configs |= cli.validate_configs;

    if let Some(port) = cli.port {
        config.listen_addr = format!("0.0.0.0:{port}");
    }

    if let Some(level) = cli.log_level.as_deref() {
        config.log.level = LogLevel::parse(level)?;
    }

    if let Some(tps) = cli.threads_per_service {
        if tps == 0 {
            return Err(miette!("--threads-per-service must be at least 1"));
        }
        config.threads_per_service = tps;
    }

    Ok(())
}
