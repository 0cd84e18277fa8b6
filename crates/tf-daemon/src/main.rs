//! taskforge daemon: loads config, starts every agent loop and runs until
//! ctrl-c.

use anyhow::{Context, Result};
use tf_core::config::Config;
use tf_daemon::daemon::Daemon;
use tf_telemetry::logging::{self, LogFormat};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // An explicit config path may be passed as the only argument.
    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            Config::load_from(&path).with_context(|| format!("failed to load config from {path}"))?
        }
        None => Config::load().context("failed to load config")?,
    };

    let format: LogFormat = config
        .general
        .log_format
        .parse()
        .context("invalid general.log_format")?;
    logging::init("tf-daemon", &config.general.log_level, format);
    info!(project = %config.general.project_name, "taskforge daemon starting");

    let home = dirs::home_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/tmp".to_string());
    config.expand_store_path(&home);

    let mut daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.stop();
    });

    daemon.run().await?;
    info!("taskforge daemon exited");
    Ok(())
}
