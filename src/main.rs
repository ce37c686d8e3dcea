//! lacecastd - run one lacecast node.
//!
//! Usage: `lacecastd [config.toml] [bootstrap-addr...]`

use lacecast::{Broadcaster, Config, metrics, telemetry};
use std::net::SocketAddr;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "lacecast.toml".to_string());

    let mut config = Config::load(&config_path).map_err(|e| {
        eprintln!("failed to load {config_path}: {e}");
        e
    })?;
    for arg in args {
        let addr: SocketAddr = arg
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bootstrap address {arg:?}: {e}"))?;
        config.overlay.bootstrap.push(addr);
    }

    telemetry::init(config.log.format);
    metrics::init();
    info!(
        listen = %config.node.listen,
        transport = ?config.node.transport,
        bootstrap = config.overlay.bootstrap.len(),
        "Starting lacecastd"
    );

    let node = Broadcaster::launch(&config).await.map_err(|e| {
        error!(error = %e, code = e.error_code(), "failed to start node");
        e
    })?;

    node.subscribe(|payload, _reply| {
        info!(%payload, "received payload");
        Ok(())
    });
    info!(id = %node.id(), addr = %node.local_addr(), phase = %node.phase(), "node running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    node.stop().await;
    Ok(())
}
