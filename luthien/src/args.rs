use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Luthien: an in-line control plane for LLM traffic.
#[derive(Debug, Parser)]
#[command(name = "luthien", version)]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "luthien.yaml")]
    pub config: PathBuf,

    /// Listen address, overriding the configuration file.
    #[arg(short, long)]
    pub listen_address: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "proxy=debug,storage=debug".
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}
