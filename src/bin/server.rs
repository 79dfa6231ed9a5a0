use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ticket_tunnel::broker::HttpBroker;
use ticket_tunnel::config::Config;
use ticket_tunnel::server::TunnelServer;
use ticket_tunnel::tls;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ticket-tunnel-server", version, about = "Ticket-authorised TLS tunnel")]
struct ServerArgs {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "/etc/ticket-tunnel/tunnel.toml")]
    config: PathBuf,
}

/// RUST_LOG wins over the configured level.
fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .with(filter)
        .init();
}

struct Pidfile(PathBuf);

impl Pidfile {
    fn create(path: &Path) -> Result<Self> {
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write pidfile {}", path.display()))?;
        Ok(Self(path.to_path_buf()))
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            warn!("Could not remove pidfile {}: {}", self.0.display(), e);
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    setup_logging(&config.log.level);

    let acceptor = tls::load_acceptor(&config.tls.certificate, &config.tls.certificate_key)
        .context("Failed to load TLS material")?;
    let broker = HttpBroker::new(&config.broker).context("Failed to set up broker client")?;

    let _pidfile = match &config.pidfile {
        Some(path) => Some(Pidfile::create(path)?),
        None => None,
    };

    let config = Arc::new(config);
    let server = TunnelServer::bind(config, acceptor, Arc::new(broker)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = server.run(shutdown_rx).await {
        error!("Server stopped: {:#}", e);
        return Err(e);
    }
    Ok(())
}
