//! Fixed-size sets of TCP connections for one sub-test.
//!
//! A connection set is opened at the start of a ping/download/upload
//! sub-test and closed at its end. Attempts that fail are dropped without
//! retry; only a completely empty set is an error.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One exclusively owned TCP connection to a measurement server.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Shut the write half down and drop the socket. Errors are ignored.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(peer = %self.peer, error = %e, "ignoring error on close");
        }
    }
}

/// Opens connection sets, optionally from a fixed local address.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    bind_ip: Option<IpAddr>,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(bind_ip: Option<IpAddr>, connect_timeout: Duration) -> Self {
        Self {
            bind_ip,
            connect_timeout,
        }
    }

    pub fn bind_ip(&self) -> Option<IpAddr> {
        self.bind_ip
    }

    /// Resolve `host` (`host:port`) and open up to `count` connections to it.
    ///
    /// Attempts run concurrently. Failed attempts are logged and dropped, so
    /// the returned set may be smaller than `count`; an empty set is
    /// reported as [`Error::Connect`].
    pub async fn open(&self, host: &str, count: usize) -> Result<Vec<Connection>> {
        let addr = self.resolve(host).await?;
        open_with(host, addr, count, |_| self.connect_one(addr)).await
    }

    /// Close every connection in the set, best effort.
    pub async fn close_all(connections: Vec<Connection>) {
        join_all(connections.into_iter().map(Connection::close)).await;
    }

    /// Pick the first resolved address usable from the bind address family.
    async fn resolve(&self, host: &str) -> Result<SocketAddr> {
        let addrs = tokio::net::lookup_host(host)
            .await
            .map_err(|e| Error::connect(host, format!("resolve failed: {}", e)))?;

        let mut candidates = addrs.filter(|addr| match self.bind_ip {
            Some(ip) => ip.is_ipv4() == addr.is_ipv4(),
            None => true,
        });

        candidates
            .next()
            .ok_or_else(|| Error::connect(host, "no address matches the bind address family"))
    }

    async fn connect_one(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(ip) = self.bind_ip {
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        let stream = tokio::time::timeout(self.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// Run `count` concurrent attempts through `connect` and keep the ones that
/// succeed.
async fn open_with<F, Fut>(host: &str, addr: SocketAddr, count: usize, connect: F) -> Result<Vec<Connection>>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = io::Result<TcpStream>>,
{
    let attempts = (0..count).map(&connect);
    let mut connections = Vec::with_capacity(count);
    let mut last_error = None;

    for (index, result) in join_all(attempts).await.into_iter().enumerate() {
        match result {
            Ok(stream) => connections.push(Connection { stream, peer: addr }),
            Err(e) => {
                warn!(%host, index, error = %e, "dropping failed connection attempt");
                last_error = Some(e);
            }
        }
    }

    if connections.is_empty() {
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no connections requested".to_string());
        return Err(Error::connect(host, reason));
    }

    debug!(%host, %addr, requested = count, opened = connections.len(), "connection set open");
    Ok(connections)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
