use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleetsync::cli::{log_filter, MasterOpts};
use fleetsync::Master;

fn main() -> Result<()> {
    let opts = MasterOpts::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_filter(opts.verbose)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = opts.load_config()?;

    // Validate root directory exists and is a directory
    if !config.root.exists() {
        anyhow::bail!("Root directory does not exist: {}", config.root.display());
    }
    if !config.root.is_dir() {
        anyhow::bail!("Root path is not a directory: {}", config.root.display());
    }
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    tracing::info!(
        node = %config.node_name,
        root = %config.root.display(),
        bind = %config.bind,
        admin = %config.admin_socket.display(),
        items = config.items.len(),
        "starting fleetsync master"
    );
    if config.bind.starts_with("0.0.0.0") {
        tracing::warn!("binding to 0.0.0.0 exposes the unauthenticated worker protocol on every interface");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let master = Master::new(config)?;
    let stop = master.stop_handle();
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received");
        stop.stop();
    })
    .context("Failed to install interrupt handler")?;

    rt.block_on(master.run())
}
