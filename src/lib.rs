//! TLS tunnel that relays remote desktop connections to backends resolved
//! from single-use tickets by an HTTP broker.

pub mod broker;
pub mod client;
pub mod config;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;
pub mod ticket;
pub mod tls;
