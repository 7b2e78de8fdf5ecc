use anyhow::{Context, Result};
use clap::Parser;

use fleetsync::admin::query;
use fleetsync::cli::CtlOpts;
use fleetsync::MasterConfig;

fn main() -> Result<()> {
    let opts = CtlOpts::parse();
    let socket = opts
        .socket
        .clone()
        .unwrap_or_else(|| MasterConfig::default().admin_socket);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let reply = rt.block_on(query(&socket, &opts.command.to_request()))?;

    let pretty = serde_json::to_string_pretty(&reply.payload())?;
    if reply.status() == fleetsync::protocol::status::ERR {
        eprintln!("{}", pretty);
        std::process::exit(1);
    }
    println!("{}", pretty);
    Ok(())
}
