#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use statecast::config::{Args, ServerConfig};
use statecast::metrics::{start_metrics_server, HealthState};
use statecast::run_with_shutdown;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let listener = TcpListener::bind(config.listen()).await?;
    info!(
        "bound to {}, relaying {}",
        config.listen(),
        config.state_path.display()
    );

    let health_state = HealthState::new();
    tokio::spawn({
        let health_state = health_state.clone();
        let metrics_addr = config.metrics_addr;
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received shutdown signal");
            }
            health_state.set_ready(false);
            let _ = shutdown_tx.send(());
        }
    });

    health_state.set_ready(true);
    if let Err(e) = run_with_shutdown(listener, config, shutdown_rx).await {
        tracing::error!("server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
