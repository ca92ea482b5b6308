//! Round-trip latency over the server's `PING` sub-protocol.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::{ConnectionPool, Transport};
use crate::wire;

/// Round trips per probe.
pub const PING_ROUNDS: u32 = 10;

/// Measures mean round-trip time over one connection.
#[derive(Debug, Clone)]
pub struct LatencyProber {
    pool: ConnectionPool,
    io_timeout: Duration,
    rounds: u32,
    cancel: CancellationToken,
}

impl LatencyProber {
    pub fn new(transport: &Transport) -> Self {
        Self {
            pool: transport.pool(),
            io_timeout: transport.io_timeout(),
            rounds: PING_ROUNDS,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `rounds` round trips instead of [`PING_ROUNDS`] (at least one).
    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds.max(1);
        self
    }

    /// Abandon probes with [`Error::Cancelled`] once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Open one connection to `host`, probe it, and close it.
    ///
    /// Returns the mean round trip in milliseconds.
    pub async fn probe_host(&self, host: &str) -> Result<f64> {
        let result = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(Error::Cancelled),

            result = self.open_and_probe(host) => result,
        };

        match &result {
            Ok(ms) => info!(%host, latency_ms = ms, rounds = self.rounds, "latency probe complete"),
            Err(e) => warn!(%host, error = %e, "latency probe failed"),
        }
        result
    }

    async fn open_and_probe(&self, host: &str) -> Result<f64> {
        let mut connections = self.pool.open(host, 1).await?;
        let result = match connections.first_mut() {
            Some(conn) => self.ping_rounds(conn.stream_mut(), host).await,
            None => Err(Error::connect(host, "empty connection set")),
        };
        ConnectionPool::close_all(connections).await;
        result
    }

    /// Run the ping rounds on an already open stream.
    ///
    /// Unanswered rounds are skipped; if none is answered the result is
    /// [`Error::NoResponse`].
    pub async fn probe<S>(&self, stream: &mut S, host: &str) -> Result<f64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(Error::Cancelled),

            result = self.ping_rounds(stream, host) => result,
        }
    }

    async fn ping_rounds<S>(&self, stream: &mut S, host: &str) -> Result<f64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reply = [0u8; wire::PING_REPLY_LEN];
        let mut total = Duration::ZERO;
        let mut answered: u32 = 0;

        for round in 0..self.rounds {
            let sent_at = Instant::now();
            let line = wire::ping_line(super::unix_nanos());

            match timeout(self.io_timeout, stream.write_all(line.as_bytes())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(%host, round, error = %e, "ping write failed");
                    continue;
                }
                Err(_) => {
                    debug!(%host, round, "ping write timed out");
                    continue;
                }
            }

            match timeout(self.io_timeout, stream.read(&mut reply)).await {
                Ok(Ok(0)) => {
                    debug!(%host, round, "connection closed by server");
                    break;
                }
                Ok(Ok(_)) => {
                    total += sent_at.elapsed();
                    answered += 1;
                }
                Ok(Err(e)) => debug!(%host, round, error = %e, "ping read failed"),
                Err(_) => {
                    // A late reply would be read as the next round's answer.
                    debug!(%host, round, "ping reply timed out, ending rounds");
                    break;
                }
            }
        }

        if answered == 0 {
            return Err(Error::NoResponse {
                host: host.to_string(),
                attempts: self.rounds,
            });
        }

        Ok((total / answered).as_secs_f64() * 1000.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
