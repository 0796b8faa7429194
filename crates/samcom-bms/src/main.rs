#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use samcom_bms::config::{Args, RelayConfig};
use samcom_bms::RelayNode;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config: RelayConfig = args.into();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let listener = TcpListener::bind(config.listen).await?;
    info!(
        relay_id = %config.relay_id,
        center = %config.center_url,
        "bound to {}", config.listen
    );

    let node = RelayNode::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = tokio::spawn(node.run(listener, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(true);

    match relay.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("relay error: {}", e),
        Err(e) => tracing::error!("relay task failed: {}", e),
    }
    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    };

    match args.log_file {
        Some(ref path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}
