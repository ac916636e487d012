use clap::Parser;
use std::path::PathBuf;

/// Serves HTTP on one TCP listener and hands it to a fresh copy of itself
/// on SIGHUP or SIGTERM, draining in-flight requests before exiting.
#[derive(Parser, Debug)]
#[command(name = "handoff", version)]
pub struct Cli {
    /// Listen on inherited descriptor 3 (internal use only)
    #[arg(short = 'g', long = "graceful")]
    pub graceful: bool,

    /// Config file [default: ./config.toml when present]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long)]
    pub addr: Option<String>,
}
