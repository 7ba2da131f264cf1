//! Command-line argument parsing.

use clap::Parser;
use vdesk_common::LogFormat;

/// vdesk Controller - virtualization and block-storage control plane
#[derive(Parser, Debug)]
#[command(name = "vdesk-controller")]
#[command(about = "vdesk Controller - virtualization and block-storage control plane")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (defaults to /etc/vdesk/controller.yaml)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Listen address for the REST API
    #[arg(long)]
    pub listen: Option<String>,

    /// Directory for JSON record persistence
    #[arg(long, env = "VDESK_STATE_DIR")]
    pub state_dir: Option<String>,

    /// Enable development mode (mock adapters and mock storage)
    #[arg(long)]
    pub dev: bool,
}
