//! # vdesk Controller
//!
//! Control plane daemon for vdesk. It owns VM, private data disk and
//! attachment records and drives compute hosts through the hypervisor
//! adapters.
//!
//! ## Usage
//! ```bash
//! vdesk-controller --config /etc/vdesk/controller.yaml
//! vdesk-controller --dev --listen 127.0.0.1:8080
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod access;
mod cli;
mod config;
mod http_server;
mod server;

use cli::Args;
use config::Config;

/// Config file read when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "/etc/vdesk/controller.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    vdesk_common::init_logging(&args.log_level, args.log_format)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting vdesk controller");

    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg.with_cli_overrides(&args)
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Config::default().with_cli_overrides(&args)
            }
        },
    };

    info!(
        listen = %config.server.listen_address,
        adapters = ?config.control.adapters,
        storage = ?config.storage.backend,
        hosts = config.hosts.len(),
        "Controller configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
