use anyhow::{Context, Result};
use clap::Parser;
use tower::ServiceBuilder;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod access_log;
mod cli;
mod config;
mod control;
mod handler;
mod listener;
mod server;
mod shutdown;
mod signals;
mod successor;

use crate::access_log::AccessLogLayer;
use crate::cli::Cli;
use crate::config::get_config;
use crate::control::Coordinator;
use crate::handler::DelayedResponse;
use crate::successor::ProcessLauncher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "handoff=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = get_config(cli.config.as_deref())?;
    if let Some(addr) = cli.addr {
        config.addr = addr;
    }

    info!(
        pid = std::process::id(),
        reborn = cli.graceful,
        addr = %config.addr,
        drain_timeout_secs = config.drain_timeout_secs,
        "Starting up"
    );

    let svc = ServiceBuilder::new()
        .layer(AccessLogLayer)
        .service(DelayedResponse::from_config(&config.handler));

    let launcher = ProcessLauncher::from_env().context("Unable to resolve the program path")?;
    let coordinator = Coordinator::start(cli.graceful, &config, svc, launcher)?;

    let report = coordinator.run(signals::subscribe).await?;
    info!(
        signal = ?report.signal,
        successor = ?report.successor.map(|s| s.pid),
        failed_restarts = report.failed_restarts,
        drained = report.drain.is_ok(),
        "Exiting"
    );

    Ok(())
}
