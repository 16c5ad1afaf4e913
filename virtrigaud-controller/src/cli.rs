//! Command-line argument parsing.

use clap::Parser;

/// virtrigaud controller manager
#[derive(Parser, Debug)]
#[command(name = "virtrigaud-controller")]
#[command(about = "virtrigaud controller manager - declarative VM control plane")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/virtrigaud/controller.yaml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,

    /// Listen address for the health endpoint
    #[arg(long)]
    pub listen: Option<String>,

    /// Worker count per resource kind
    #[arg(long)]
    pub workers: Option<usize>,

    /// Enable development mode (in-memory mock providers)
    #[arg(long)]
    pub dev: bool,
}
