use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use ticket_tunnel::client::TunnelClient;
use ticket_tunnel::ticket::Ticket;
use ticket_tunnel::tls::{self, ServerTrust};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ticket-tunnel-client", version, about = "Talks to a ticket tunnel")]
struct ClientArgs {
    #[command(flatten)]
    conn: ConnectionArgs,

    #[command(subcommand)]
    command: ClientCommand,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Tunnel address, e.g. "tunnel.example.com:4443"
    #[arg(long, default_value = "127.0.0.1:4443")]
    server: String,

    /// Path to CA certificate (PEM) to trust
    #[arg(long, conflicts_with = "insecure")]
    ca: Option<PathBuf>,

    /// SNI name; defaults to the host part of --server
    #[arg(long)]
    sni: Option<String>,

    /// Accept any server certificate
    #[arg(long)]
    insecure: bool,

    /// Do not send the handshake prefix before TLS
    #[arg(long)]
    no_handshake: bool,

    /// Seconds to wait for connect and replies
    #[arg(long, default_value_t = 10.0)]
    timeout: f64,
}

#[derive(Subcommand)]
enum ClientCommand {
    /// Liveness check (TEST)
    Check,
    /// Connection and traffic counters (INFO, or STAT with --detailed)
    Stats {
        /// Admin secret
        #[arg(long, env = "TICKET_TUNNEL_SECRET")]
        secret: String,

        /// Include one line per worker
        #[arg(long)]
        detailed: bool,
    },
    /// Relay local connections through tunnels opened with a ticket
    Forward {
        /// 48 character open ticket
        #[arg(long)]
        ticket: Ticket,

        /// Local address to listen on
        #[arg(long, default_value = "127.0.0.1:3389")]
        listen: String,
    },
}

fn host_of(server: &str) -> &str {
    match server.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => server,
    }
}

impl ConnectionArgs {
    fn client(&self) -> Result<TunnelClient> {
        let trust = match (&self.ca, self.insecure) {
            (_, true) => ServerTrust::Insecure,
            (Some(ca), false) => ServerTrust::Roots(tls::load_certs(ca)?),
            (None, false) => anyhow::bail!("Either --ca or --insecure is required"),
        };
        let sni = self.sni.as_deref().unwrap_or_else(|| host_of(&self.server));
        Ok(TunnelClient::new(
            self.server.clone(),
            tls::connector(trust)?,
            tls::server_name(sni)?,
        )
        .with_handshake(!self.no_handshake)
        .with_timeout(Duration::from_secs_f64(self.timeout)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let args = ClientArgs::parse();
    let client = args.conn.client()?;

    match args.command {
        ClientCommand::Check => {
            client.check().await?;
            println!("OK");
        }
        ClientCommand::Stats { secret, detailed } => {
            let report = client.stats(&secret, detailed).await?;
            println!("{}", report.total);
            for (i, worker) in report.workers.iter().enumerate() {
                println!("worker{i};{worker}");
            }
        }
        ClientCommand::Forward { ticket, listen } => {
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("Failed to bind to {listen}"))?;
            tokio::select! {
                result = Arc::new(client).forward(listener, ticket) => result?,
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sni_defaults_to_host() {
        assert_eq!(host_of("tunnel.example.com:4443"), "tunnel.example.com");
        assert_eq!(host_of("[::1]:4443"), "::1");
        assert_eq!(host_of("localhost"), "localhost");
    }
}
