//! Outbound transports: the shared HTTP client and the raw TCP connection pool.
//!
//! Both honour the same optional local bind address. A [`Transport`] is built
//! once per run and handed to every component that talks to the network.

pub mod pool;

use std::net::IpAddr;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::Result;

pub use pool::{Connection, ConnectionPool};

/// Immutable per-run network settings plus the shared HTTP client.
///
/// Cloning is cheap; the underlying `reqwest::Client` is reference counted
/// and safe for concurrent use.
#[derive(Debug, Clone)]
pub struct Transport {
    http: Client,
    bind_ip: Option<IpAddr>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl Transport {
    /// Build the transport from configuration.
    ///
    /// Proxy settings come from the environment (`HTTP_PROXY`, `HTTPS_PROXY`,
    /// `NO_PROXY`), which is `reqwest`'s default behaviour.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        // reqwest bounds TCP connect and TLS handshake with a single budget.
        let http = Client::builder()
            .local_address(config.bind_ip)
            .connect_timeout(config.connect_timeout() + config.tls_handshake_timeout())
            .timeout(config.request_timeout())
            .tcp_keepalive(config.keepalive())
            .user_agent(config.user_agent.as_str())
            .build()?;

        debug!(
            bind_ip = ?config.bind_ip,
            connect_timeout_secs = config.connect_timeout_secs,
            io_timeout_secs = config.io_timeout_secs,
            request_timeout_secs = config.request_timeout_secs,
            "transport ready"
        );

        Ok(Self {
            http,
            bind_ip: config.bind_ip,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn bind_ip(&self) -> Option<IpAddr> {
        self.bind_ip
    }

    /// Upper bound on a single socket read or write.
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// A TCP connection pool sharing this transport's bind address.
    pub fn pool(&self) -> ConnectionPool {
        ConnectionPool::new(self.bind_ip, self.connect_timeout)
    }
}
