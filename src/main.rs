//! rtmp-relay binary
//!
//! ```bash
//! rtmp-relay --config relay.toml
//! RELAY__RTMP__PORT=1936 rtmp-relay --log-level debug
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use rtmp_relay::{HttpServer, RtmpServer, ServerStats, Settings, StreamRegistry};

#[derive(Debug, Parser)]
#[command(name = "rtmp-relay", version, about = "RTMP ingest/relay server")]
struct Args {
    /// Config file (TOML, YAML or JSON)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `rtmp_relay=debug`; RUST_LOG wins when set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    let server_config = settings.server_config()?;
    let http_config = settings.http_config()?;

    let registry = Arc::new(StreamRegistry::with_config(server_config.registry_config()));
    let stats = Arc::new(ServerStats::new());

    let rtmp = RtmpServer::bind(server_config, registry.clone(), stats.clone())
        .await
        .context("RTMP listener")?;
    let http = HttpServer::bind(&http_config, registry, stats)
        .await
        .context("HTTP listener")?;

    tracing::info!(
        "RTMP Server running on rtmp://localhost:{}",
        rtmp.local_addr()?.port()
    );
    tracing::info!(
        "HTTP Server running on http://localhost:{}",
        http.local_addr()?.port()
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let http_task = tokio::spawn(http.run_until(async move {
        let _ = shutdown_rx.changed().await;
    }));

    rtmp.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    let _ = shutdown_tx.send(true);
    http_task.await.context("HTTP server task")??;

    tracing::info!("Server stopped");
    Ok(())
}
