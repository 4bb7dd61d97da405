use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use netwatch::agent::Agent;
use netwatch::capture;
use netwatch::config::Config;

fn main() -> Result<()> {
    let cfg = Config::parse();

    // Interface listing needs no capture privileges or configuration.
    if cfg.list_ifaces {
        for name in capture::list_ifaces() {
            println!("{name}");
        }
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    cfg.validate()?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting netwatch");

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = Agent::new(cfg);
    agent.start().await?;

    // Wait for a signal or for the agent to shut itself down (e.g. on
    // packet-source termination).
    let agent_done = agent.cancel_token();
    tokio::select! {
        _ = shutdown_rx => {}
        _ = agent_done.cancelled() => {}
    }

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("netwatch stopped");

    Ok(())
}
