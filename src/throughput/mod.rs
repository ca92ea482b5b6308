//! Throughput testing: multi-socket TCP engine, HTTP fallback, result folding.

pub mod http;
pub mod report;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{BandwidthConfig, EngineKind};
use crate::error::Result;
use crate::registry::Server;
use crate::transport::Transport;

pub use http::HttpBandwidthTester;
pub use tcp::TcpBandwidthTester;

/// Parallel connections per download/upload sub-test.
pub const DEFAULT_CONNECTIONS: usize = 10;

/// Download/upload frame size.
pub const FRAME_SIZE: usize = 65_536;

/// Frame size in saving mode.
pub const SAVING_FRAME_SIZE: usize = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// Timing of one bandwidth sub-test.
///
/// Traffic flows for `total`; only bytes completed after `warmup` count, and
/// the count is divided by `measurement` regardless of how long the loop
/// actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    pub total: Duration,
    pub warmup: Duration,
    pub measurement: Duration,
}

impl Default for Windows {
    fn default() -> Self {
        Self {
            total: Duration::from_secs(10),
            warmup: Duration::from_secs(3),
            measurement: Duration::from_secs(7),
        }
    }
}

impl Windows {
    /// Windows with `measurement = total - warmup`.
    pub fn new(total: Duration, warmup: Duration) -> Self {
        Self {
            total,
            warmup: warmup.min(total),
            measurement: total.saturating_sub(warmup),
        }
    }
}

/// Aggregate result of one sub-test.
#[derive(Debug, Clone, Serialize)]
pub struct BandwidthMeasurement {
    pub direction: Direction,
    /// Bits per second of each worker that ran to completion.
    pub per_connection_bps: Vec<f64>,
    /// Sum of `per_connection_bps`.
    pub bits_per_second: f64,
}

impl BandwidthMeasurement {
    pub fn from_workers(direction: Direction, per_connection_bps: Vec<f64>) -> Self {
        let bits_per_second = per_connection_bps.iter().sum();
        Self {
            direction,
            per_connection_bps,
            bits_per_second,
        }
    }

    pub fn connections(&self) -> usize {
        self.per_connection_bps.len()
    }

    /// Throughput in Mbit/s (binary mega: bits / 1024 / 1024).
    pub fn mbps(&self) -> f64 {
        bits_to_mbps(self.bits_per_second)
    }
}

pub fn bits_to_mbps(bits_per_second: f64) -> f64 {
    bits_per_second / 1024.0 / 1024.0
}

/// A transport that can measure download and upload throughput to a server.
///
/// Both methods return Mbit/s.
#[async_trait]
pub trait BandwidthEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn download(&self, server: &Server) -> Result<f64>;

    async fn upload(&self, server: &Server) -> Result<f64>;
}

/// Build the engine selected in configuration.
pub fn build_engine(
    transport: &Transport,
    config: &BandwidthConfig,
    cancel: CancellationToken,
) -> Box<dyn BandwidthEngine> {
    match config.engine {
        EngineKind::Tcp => Box::new(TcpBandwidthTester::new(transport, config, cancel)),
        EngineKind::Http => Box::new(HttpBandwidthTester::new(transport, config.saving_mode, cancel)),
    }
}
