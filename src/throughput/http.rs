//! HTTP fallback engine: image downloads and form uploads against the
//! server's `/speedtest/` resources.
//!
//! A short two-request warmup estimates the link speed, which then picks how
//! many requests of which size the measurement phase issues.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::{try_join, try_join_all};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{bits_to_mbps, BandwidthEngine};
use crate::error::{Error, Result};
use crate::registry::Server;
use crate::transport::Transport;

/// Edge length in pixels of the `random<W>x<W>.jpg` images.
pub const DOWNLOAD_SIZES: [usize; 10] = [350, 500, 750, 1000, 1500, 2000, 2500, 3000, 3500, 4000];

/// Upload body sizes in KB.
pub const UPLOAD_SIZES_KB: [usize; 10] = [100, 300, 500, 800, 1000, 1500, 2500, 3000, 3500, 4000];

const DOWNLOAD_WARMUP_INDEX: usize = 2;
const UPLOAD_WARMUP_INDEX: usize = 4;
const WARMUP_REQUESTS: usize = 2;

/// `(workload, weight)` for the download measurement given the warmup speed.
///
/// `workload` is the number of concurrent requests and `weight` indexes
/// [`DOWNLOAD_SIZES`]. `None` means the warmup speed is the result.
pub fn download_workload(warmup_mbps: f64, saving_mode: bool) -> Option<(usize, usize)> {
    if saving_mode {
        Some((6, 3))
    } else if warmup_mbps > 50.0 {
        Some((32, 6))
    } else if warmup_mbps > 10.0 {
        Some((16, 4))
    } else if warmup_mbps > 4.0 {
        Some((8, 4))
    } else if warmup_mbps > 2.5 {
        Some((4, 4))
    } else {
        None
    }
}

/// Upload counterpart of [`download_workload`], indexing [`UPLOAD_SIZES_KB`].
pub fn upload_workload(warmup_mbps: f64, saving_mode: bool) -> Option<(usize, usize)> {
    if saving_mode {
        Some((1, 7))
    } else if warmup_mbps > 50.0 {
        Some((40, 9))
    } else if warmup_mbps > 10.0 {
        Some((16, 9))
    } else if warmup_mbps > 4.0 {
        Some((8, 9))
    } else if warmup_mbps > 2.5 {
        Some((4, 5))
    } else {
        None
    }
}

/// Form payload for an upload of `size_kb`.
pub fn upload_content(size_kb: usize) -> String {
    "0123456789".repeat((size_kb * 100).saturating_sub(51))
}

fn rate_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bits_to_mbps(bytes as f64 * 8.0 / secs)
}

/// Warmup time with the server's round trip taken out, unless that would
/// leave nothing.
fn warmup_elapsed(elapsed: Duration, latency_ms: Option<f64>) -> Duration {
    let latency = latency_ms
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .unwrap_or_default();
    match elapsed.checked_sub(latency) {
        Some(adjusted) if !adjusted.is_zero() => adjusted,
        _ => elapsed,
    }
}

// ---------------------------------------------------------------------------
// HttpBandwidthTester
// ---------------------------------------------------------------------------

pub struct HttpBandwidthTester {
    transport: Transport,
    saving_mode: bool,
    cancel: CancellationToken,
}

impl HttpBandwidthTester {
    pub fn new(transport: &Transport, saving_mode: bool, cancel: CancellationToken) -> Self {
        Self {
            transport: transport.clone(),
            saving_mode,
            cancel,
        }
    }

    /// Download speed in Mbit/s; in-flight requests are dropped on cancellation.
    pub async fn download_mbps(&self, server: &Server) -> Result<f64> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(Error::Cancelled),

            result = self.measure_download(server) => result,
        }
    }

    /// Upload speed in Mbit/s; in-flight requests are dropped on cancellation.
    pub async fn upload_mbps(&self, server: &Server) -> Result<f64> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(Error::Cancelled),

            result = self.measure_upload(server) => result,
        }
    }

    async fn measure_download(&self, server: &Server) -> Result<f64> {
        let base = server.download_base();

        let size = DOWNLOAD_SIZES[DOWNLOAD_WARMUP_INDEX];
        let started = Instant::now();
        let (a, b) = try_join(self.fetch_image(base, size), self.fetch_image(base, size)).await?;
        let elapsed = warmup_elapsed(started.elapsed(), server.latency_ms);
        let warmup = rate_mbps(a + b, elapsed);
        debug!(server_id = %server.id, requests = WARMUP_REQUESTS, warmup_mbps = warmup, "http download warmup");

        let Some((workload, weight)) = download_workload(warmup, self.saving_mode) else {
            info!(server_id = %server.id, mbps = warmup, "http download below workload threshold");
            return Ok(warmup);
        };

        let size = DOWNLOAD_SIZES[weight];
        let started = Instant::now();
        let received = try_join_all((0..workload).map(|_| self.fetch_image(base, size))).await?;
        let mbps = rate_mbps(received.iter().sum(), started.elapsed());

        info!(server_id = %server.id, workload, size, mbps, "http download complete");
        Ok(mbps)
    }

    async fn measure_upload(&self, server: &Server) -> Result<f64> {
        let url = server.url.as_str();

        let content = upload_content(UPLOAD_SIZES_KB[UPLOAD_WARMUP_INDEX]);
        let started = Instant::now();
        let (a, b) = try_join(self.post_content(url, &content), self.post_content(url, &content)).await?;
        let elapsed = warmup_elapsed(started.elapsed(), server.latency_ms);
        let warmup = rate_mbps(a + b, elapsed);
        debug!(server_id = %server.id, requests = WARMUP_REQUESTS, warmup_mbps = warmup, "http upload warmup");

        let Some((workload, weight)) = upload_workload(warmup, self.saving_mode) else {
            info!(server_id = %server.id, mbps = warmup, "http upload below workload threshold");
            return Ok(warmup);
        };

        let content = upload_content(UPLOAD_SIZES_KB[weight]);
        let started = Instant::now();
        let sent = try_join_all((0..workload).map(|_| self.post_content(url, &content))).await?;
        let mbps = rate_mbps(sent.iter().sum(), started.elapsed());

        info!(server_id = %server.id, workload, size_kb = UPLOAD_SIZES_KB[weight], mbps, "http upload complete");
        Ok(mbps)
    }

    async fn fetch_image(&self, base: &str, size: usize) -> Result<u64> {
        let url = format!("{}/random{}x{}.jpg", base, size, size);
        let body = self
            .transport
            .http()
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(body.len() as u64)
    }

    async fn post_content(&self, url: &str, content: &str) -> Result<u64> {
        self.transport
            .http()
            .post(url)
            .form(&[("content", content)])
            .send()
            .await?
            .error_for_status()?;
        Ok(content.len() as u64)
    }
}

#[async_trait]
impl BandwidthEngine for HttpBandwidthTester {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn download(&self, server: &Server) -> Result<f64> {
        self.download_mbps(server).await
    }

    async fn upload(&self, server: &Server) -> Result<f64> {
        self.upload_mbps(server).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
