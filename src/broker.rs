//! Control plane broker: exchanges open tickets for destinations and
//! records the end of each session.

use crate::config::BrokerConfig;
use crate::ticket::{Ticket, TicketError};
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, error};

pub const USER_AGENT: &str = concat!("ticket-tunnel/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid ticket: {0}")]
    InvalidTicket(#[from] TicketError),

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("broker rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub host: String,
    pub port: u16,
    pub notify_ticket: Ticket,
}

impl ResolvedDestination {
    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Resolves a raw open ticket received from `caller`.
    ///
    /// Ticket syntax is checked before anything goes on the wire.
    async fn resolve(&self, ticket: &[u8], caller: IpAddr)
        -> Result<ResolvedDestination, BrokerError>;

    /// Reports the end of a session. Never fails; problems are logged.
    async fn notify_end(&self, notify: &Ticket, sent: u64, recv: u64);
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(u16),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct TicketResponse {
    host: String,
    port: PortField,
    notify: String,
}

impl TryFrom<TicketResponse> for ResolvedDestination {
    type Error = BrokerError;

    fn try_from(resp: TicketResponse) -> Result<Self, Self::Error> {
        let port = match resp.port {
            PortField::Number(p) => p,
            PortField::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| BrokerError::Rejected(format!("invalid port {s:?}")))?,
        };
        if resp.host.is_empty() || port == 0 {
            return Err(BrokerError::Rejected("empty destination".into()));
        }
        let notify_ticket = Ticket::parse(resp.notify.as_bytes())
            .map_err(|e| BrokerError::Rejected(format!("invalid notify ticket: {e}")))?;
        Ok(ResolvedDestination {
            host: resp.host,
            port,
            notify_ticket,
        })
    }
}

/// Request URLs carry the ticket and the shared token, so they never go
/// into error text.
fn unreachable(e: reqwest::Error) -> BrokerError {
    BrokerError::Unreachable(e.without_url().to_string())
}

/// Broker reached over HTTP(S).
///
/// URLs are `{url}/{ticket}/{action}/{token}` where action is the caller IP
/// for resolution and `stop` for end notifications.
#[derive(Debug, Clone)]
pub struct HttpBroker {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpBroker {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        // No idle pooling: sessions run on several worker runtimes and a
        // pooled connection is bound to the runtime that opened it.
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_ssl)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| BrokerError::Unreachable(format!("client setup: {e}")))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, ticket: &Ticket, action: &str) -> String {
        format!("{}/{}/{}/{}", self.base_url, ticket, action, self.token)
    }

    async fn get(&self, url: String, query: &[(&str, String)]) -> Result<reqwest::Response, BrokerError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(unreachable)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrokerError::Rejected(format!("{status}: {}", body.trim())));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn resolve(
        &self,
        ticket: &[u8],
        caller: IpAddr,
    ) -> Result<ResolvedDestination, BrokerError> {
        let ticket = Ticket::parse(ticket)?;
        let resp = self
            .get(self.url(&ticket, &caller.to_canonical().to_string()), &[])
            .await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(unreachable)?;
        let body: TicketResponse = serde_json::from_slice(&bytes)
            .map_err(|e| BrokerError::Rejected(format!("malformed response: {e}")))?;
        let destination = ResolvedDestination::try_from(body)?;
        debug!("ticket {:?} resolved to {}", ticket, destination.address());
        Ok(destination)
    }

    async fn notify_end(&self, notify: &Ticket, sent: u64, recv: u64) {
        let query = [("sent", sent.to_string()), ("recv", recv.to_string())];
        if let Err(e) = self.get(self.url(notify, "stop"), &query).await {
            error!("ERROR notifying end to broker: {}", e);
        }
    }
}
