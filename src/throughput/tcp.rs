//! Multi-socket TCP bandwidth tester over the `DOWNLOAD`/`UPLOAD` sub-protocols.
//!
//! Each sub-test opens a fresh connection set and runs one worker per
//! connection. Workers share nothing but the cancellation token: each owns
//! its socket, buffer and byte counter, and the counters are only read after
//! every worker has been joined.

use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{BandwidthEngine, BandwidthMeasurement, Direction, Windows, FRAME_SIZE, SAVING_FRAME_SIZE};
use crate::config::BandwidthConfig;
use crate::error::{Error, Result};
use crate::registry::Server;
use crate::transport::{Connection, ConnectionPool, Transport};
use crate::wire;

// ---------------------------------------------------------------------------
// TcpBandwidthTester
// ---------------------------------------------------------------------------

/// Raw TCP throughput engine.
pub struct TcpBandwidthTester {
    pool: ConnectionPool,
    io_timeout: Duration,
    connections: usize,
    frame_size: usize,
    windows: Windows,
    cancel: CancellationToken,
}

impl TcpBandwidthTester {
    pub fn new(transport: &Transport, config: &BandwidthConfig, cancel: CancellationToken) -> Self {
        let frame_size = if config.saving_mode {
            SAVING_FRAME_SIZE
        } else {
            FRAME_SIZE
        };
        Self {
            pool: transport.pool(),
            io_timeout: transport.io_timeout(),
            connections: config.connections.max(1),
            frame_size,
            windows: Windows::default(),
            cancel,
        }
    }

    pub fn with_windows(mut self, windows: Windows) -> Self {
        self.windows = windows;
        self
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size.max(wire::MIN_FRAME_SIZE);
        self
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Run one download or upload sub-test against `host`.
    ///
    /// Fails with [`Error::Connect`] when no connection opens or a worker
    /// cannot start. A transient failure inside a download loop only costs
    /// that iteration's bytes.
    pub async fn measure(&self, host: &str, direction: Direction) -> Result<BandwidthMeasurement> {
        let connections = self.pool.open(host, self.connections).await?;
        self.run_connections(host, direction, connections).await
    }

    /// Run one worker per opened connection and sum their throughput.
    ///
    /// The set may be smaller than requested; only the connections that
    /// opened contribute.
    async fn run_connections(
        &self,
        host: &str,
        direction: Direction,
        connections: Vec<Connection>,
    ) -> Result<BandwidthMeasurement> {
        let test_id = Uuid::new_v4().to_string();

        info!(
            test_id = test_id.as_str(),
            %host,
            %direction,
            requested = self.connections,
            opened = connections.len(),
            frame_size = self.frame_size,
            "starting bandwidth test"
        );

        let params = LoopParams {
            test_id: test_id.clone(),
            host: host.to_string(),
            direction,
            frame_size: self.frame_size,
            upload_frame: wire::upload_frame(self.frame_size),
            windows: self.windows,
            io_timeout: self.io_timeout,
            cancel: self.cancel.clone(),
        };

        let mut workers = JoinSet::new();
        for (index, connection) in connections.into_iter().enumerate() {
            workers.spawn(run_worker(index, connection, params.clone()));
        }

        let mut counts = Vec::new();
        let mut finished = Vec::new();
        let mut setup_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(outcome)) => {
                    counts.push(outcome.counted_bytes);
                    finished.push(outcome.connection);
                }
                Ok(Err(e)) => {
                    warn!(test_id = test_id.as_str(), error = %e, "worker failed to start");
                    setup_error.get_or_insert(e);
                }
                Err(e) => {
                    warn!(test_id = test_id.as_str(), error = %e, "worker aborted");
                    setup_error.get_or_insert(Error::connect(host, format!("worker aborted: {}", e)));
                }
            }
        }
        ConnectionPool::close_all(finished).await;

        if let Some(e) = setup_error {
            return Err(e);
        }

        let seconds = self.windows.measurement.as_secs_f64();
        let per_connection = counts
            .into_iter()
            .map(|counted| throughput_bps(counted, seconds))
            .collect();
        let measurement = BandwidthMeasurement::from_workers(direction, per_connection);

        info!(
            test_id = test_id.as_str(),
            %host,
            %direction,
            connections = measurement.connections(),
            mbps = measurement.mbps(),
            cancelled = self.cancel.is_cancelled(),
            "bandwidth test complete"
        );
        Ok(measurement)
    }
}

#[async_trait]
impl BandwidthEngine for TcpBandwidthTester {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn download(&self, server: &Server) -> Result<f64> {
        Ok(self.measure(&server.host, Direction::Download).await?.mbps())
    }

    async fn upload(&self, server: &Server) -> Result<f64> {
        Ok(self.measure(&server.host, Direction::Upload).await?.mbps())
    }
}

fn throughput_bps(counted_bytes: u64, measurement_secs: f64) -> f64 {
    if measurement_secs <= 0.0 {
        return 0.0;
    }
    counted_bytes as f64 * 8.0 / measurement_secs
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct LoopParams {
    test_id: String,
    host: String,
    direction: Direction,
    frame_size: usize,
    upload_frame: Bytes,
    windows: Windows,
    io_timeout: Duration,
    cancel: CancellationToken,
}

struct WorkerOutcome {
    connection: Connection,
    counted_bytes: u64,
}

enum Step<T> {
    Done(T),
    Failed(io::Error),
    TimedOut,
    Cancelled,
}

impl LoopParams {
    /// Run one socket operation, bounded by the I/O timeout and the end of
    /// the window, and abandoned on cancellation.
    async fn step<T, F>(&self, window_end: Instant, op: F) -> Step<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        let limit = (Instant::now() + self.io_timeout).min(window_end);
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Step::Cancelled,

            result = timeout_at(limit, op) => match result {
                Ok(Ok(value)) => Step::Done(value),
                Ok(Err(e)) => Step::Failed(e),
                Err(_) => Step::TimedOut,
            },
        }
    }
}

async fn run_worker(index: usize, mut connection: Connection, params: LoopParams) -> Result<WorkerOutcome> {
    // A connection reset between open and start counts as a setup failure.
    let peer = connection
        .stream_mut()
        .peer_addr()
        .map_err(|e| Error::connect(&params.host, e))?;

    let stream = connection.stream_mut();
    let counted_bytes = match params.direction {
        Direction::Download => download_loop(stream, &params).await,
        Direction::Upload => upload_loop(stream, &params).await,
    };

    debug!(
        test_id = params.test_id.as_str(),
        worker = index,
        %peer,
        counted_bytes,
        "worker finished"
    );
    Ok(WorkerOutcome {
        connection,
        counted_bytes,
    })
}

/// Errors after which the socket is unusable for the rest of the window.
fn is_terminal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Request frames and count received payload plus framing overhead.
async fn download_loop<S>(stream: &mut S, params: &LoopParams) -> u64
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = wire::download_request(params.frame_size);
    let mut buf = vec![0u8; params.frame_size];
    let started = Instant::now();
    let window_end = started + params.windows.total;
    let mut counted: u64 = 0;

    while started.elapsed() < params.windows.total {
        match params.step(window_end, stream.write_all(request.as_bytes())).await {
            Step::Done(()) => {}
            Step::Cancelled => break,
            Step::Failed(e) if is_terminal(&e) => break,
            Step::Failed(_) | Step::TimedOut => continue,
        }

        match params.step(window_end, stream.read(&mut buf)).await {
            Step::Done(0) => break,
            Step::Done(n) => {
                if started.elapsed() > params.windows.warmup {
                    let n = n as u64;
                    counted += n + wire::framing_overhead(n);
                }
            }
            Step::Cancelled => break,
            Step::Failed(e) if is_terminal(&e) => break,
            Step::Failed(_) | Step::TimedOut => {}
        }
    }
    counted
}

/// Send fixed-size frames and count what the server acknowledges plus
/// framing overhead of the frame sent.
///
/// Any failed or timed-out frame write ends the loop.
async fn upload_loop<S>(stream: &mut S, params: &LoopParams) -> u64
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = &params.upload_frame;
    let overhead = wire::framing_overhead(frame.len() as u64);
    let mut reply = [0u8; wire::UPLOAD_REPLY_LEN];
    let started = Instant::now();
    let window_end = started + params.windows.total;
    let mut counted: u64 = 0;

    while started.elapsed() < params.windows.total {
        match params.step(window_end, stream.write_all(frame)).await {
            Step::Done(()) => {}
            // A partly written frame leaves the stream off a frame boundary.
            Step::Cancelled | Step::Failed(_) | Step::TimedOut => break,
        }

        match params.step(window_end, stream.read(&mut reply)).await {
            Step::Done(0) => break,
            Step::Done(n) => {
                if started.elapsed() > params.windows.warmup {
                    match wire::parse_upload_ack(&reply[..n]) {
                        Some(acked) => counted += acked + overhead,
                        None => trace!(
                            test_id = params.test_id.as_str(),
                            reply = %String::from_utf8_lossy(&reply[..n]),
                            "skipping malformed upload ack"
                        ),
                    }
                }
            }
            Step::Cancelled => break,
            Step::Failed(e) if is_terminal(&e) => break,
            Step::Failed(_) | Step::TimedOut => {}
        }
    }
    counted
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::test_support::{spawn_download_peer, spawn_upload_peer};
    use tokio::net::TcpListener;

    const FOREVER: Duration = Duration::from_secs(3600);

    fn tester(connections: usize, windows: Windows, cancel: CancellationToken) -> TcpBandwidthTester {
        let transport = Transport::new(&TransportConfig {
            io_timeout_secs: 2,
            ..TransportConfig::default()
        })
        .unwrap();
        let config = BandwidthConfig {
            connections,
            ..BandwidthConfig::default()
        };
        TcpBandwidthTester::new(&transport, &config, cancel).with_windows(windows)
    }

    fn short_windows() -> Windows {
        Windows::new(Duration::from_millis(2000), Duration::from_millis(500))
    }

    fn assert_within(measured: f64, expected: f64) {
        assert!(
            measured > expected * 0.8 && measured < expected * 1.3,
            "measured {:.0} bit/s, expected about {:.0} bit/s",
            measured,
            expected
        );
    }

    /// 14600 bytes every 10 ms per connection, plus 54 bytes per 1460.
    fn expected_download_bps(connections: usize) -> f64 {
        let rate = 14_600.0 / 0.010;
        rate * 8.0 * (1.0 + 54.0 / 1460.0) * connections as f64
    }

    #[tokio::test]
    async fn test_download_single_connection_converges() {
        let host = spawn_download_peer(14_600, Duration::from_millis(10), FOREVER).await;

        let m = tester(1, short_windows(), CancellationToken::new())
            .measure(&host, Direction::Download)
            .await
            .expect("download should succeed");

        assert_eq!(m.connections(), 1);
        assert_within(m.bits_per_second, expected_download_bps(1));
    }

    #[tokio::test]
    async fn test_download_ten_connections_converge() {
        let host = spawn_download_peer(14_600, Duration::from_millis(10), FOREVER).await;

        let m = tester(10, short_windows(), CancellationToken::new())
            .measure(&host, Direction::Download)
            .await
            .expect("download should succeed");

        assert_eq!(m.connections(), 10);
        assert_within(m.bits_per_second, expected_download_bps(10));
    }

    #[tokio::test]
    async fn test_upload_counts_acknowledged_bytes() {
        let frame = 8192;
        let host = spawn_upload_peer(frame, Duration::from_millis(5), None).await;

        let m = tester(2, short_windows(), CancellationToken::new())
            .with_frame_size(frame)
            .measure(&host, Direction::Upload)
            .await
            .expect("upload should succeed");

        let rate = frame as f64 / 0.005;
        let overhead = wire::framing_overhead(frame as u64) as f64 / frame as f64;
        assert_within(m.bits_per_second, rate * 8.0 * (1.0 + overhead) * 2.0);
    }

    #[tokio::test]
    async fn test_malformed_upload_acks_count_nothing() {
        let frame = 4096;
        let host = spawn_upload_peer(frame, Duration::from_millis(5), Some("garbage\n")).await;

        let m = tester(1, Windows::new(Duration::from_millis(800), Duration::from_millis(200)), CancellationToken::new())
            .with_frame_size(frame)
            .measure(&host, Direction::Upload)
            .await
            .expect("malformed acks are not an error");

        assert_eq!(m.connections(), 1);
        assert_eq!(m.bits_per_second, 0.0);
    }

    #[tokio::test]
    async fn test_warmup_traffic_is_not_counted() {
        let host = spawn_download_peer(14_600, Duration::from_millis(10), Duration::from_millis(250)).await;

        let windows = Windows::new(Duration::from_millis(1500), Duration::from_millis(600));
        let m = tester(2, windows, CancellationToken::new())
            .measure(&host, Direction::Download)
            .await
            .expect("download should succeed");

        assert_eq!(m.bits_per_second, 0.0);
    }

    #[tokio::test]
    async fn test_cancellation_ends_workers_early() {
        let host = spawn_download_peer(14_600, Duration::from_millis(10), FOREVER).await;
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let m = tester(3, Windows::default(), cancel)
            .measure(&host, Direction::Download)
            .await
            .expect("cancelled run still reports");

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(m.connections(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = tester(4, short_windows(), CancellationToken::new())
            .measure(&host, Direction::Download)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect { .. }), "got {:?}", err);
    }

    fn loop_params(direction: Direction, frame_size: usize) -> LoopParams {
        LoopParams {
            test_id: "scripted".to_string(),
            host: "mock".to_string(),
            direction,
            frame_size,
            upload_frame: wire::upload_frame(frame_size),
            windows: Windows::new(Duration::from_secs(5), Duration::ZERO),
            io_timeout: Duration::from_secs(1),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_download_loop_stops_on_reset() {
        let mut stream = tokio_test::io::Builder::new()
            .write(b"DOWNLOAD 64\n")
            .read(&[b'x'; 64])
            .write(b"DOWNLOAD 64\n")
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();

        let counted = download_loop(&mut stream, &loop_params(Direction::Download, 64)).await;
        assert_eq!(counted, 64 + 54);
    }

    #[tokio::test]
    async fn test_upload_loop_skips_bad_acks() {
        let params = loop_params(Direction::Upload, 64);
        let frame = params.upload_frame.clone();
        let mut stream = tokio_test::io::Builder::new()
            .write(&frame)
            .read(b"OK 64 1\n")
            .write(&frame)
            .read(b"OK lots\n")
            .write(&frame)
            .read_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();

        let counted = upload_loop(&mut stream, &params).await;
        assert_eq!(counted, 64 + 54);
    }

    #[tokio::test]
    async fn test_download_loop_survives_transient_errors() {
        let mut stream = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::Other, "interrupted"))
            .write(b"DOWNLOAD 64\n")
            .read_error(io::Error::from(io::ErrorKind::TimedOut))
            .write(b"DOWNLOAD 64\n")
            .read(&[b'x'; 64])
            .write(b"DOWNLOAD 64\n")
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();

        let counted = download_loop(&mut stream, &loop_params(Direction::Download, 64)).await;
        assert_eq!(counted, 64 + 54);
    }

    #[tokio::test]
    async fn test_upload_loop_stops_on_failed_write() {
        let params = loop_params(Direction::Upload, 64);
        let frame = params.upload_frame.clone();
        let mut stream = tokio_test::io::Builder::new()
            .write(&frame)
            .read(b"OK 64 1\n")
            .write_error(io::Error::new(io::ErrorKind::Other, "short write"))
            .build();

        let counted = upload_loop(&mut stream, &params).await;
        assert_eq!(counted, 64 + 54);
    }

    #[tokio::test]
    async fn test_partial_connection_set_sums_survivors() {
        let host = spawn_download_peer(14_600, Duration::from_millis(10), FOREVER).await;
        let engine = tester(4, short_windows(), CancellationToken::new());

        let mut connections = engine.pool.open(&host, 4).await.unwrap();
        connections.truncate(2);

        let m = engine
            .run_connections(&host, Direction::Download, connections)
            .await
            .expect("surviving connections report");

        assert_eq!(m.connections(), 2);
        assert_within(m.bits_per_second, expected_download_bps(2));
    }

    #[tokio::test]
    async fn test_reset_before_start_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                #[allow(deprecated)]
                stream.set_linger(Some(Duration::ZERO)).unwrap();
                drop(stream);
            }
        });

        let engine = tester(1, short_windows(), CancellationToken::new());
        let connections = engine.pool.open(&host, 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = engine
            .run_connections(&host, Direction::Download, connections)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connect { .. }), "got {:?}", err);
    }

    #[test]
    fn test_saving_mode_shrinks_frames() {
        let transport = Transport::new(&TransportConfig::default()).unwrap();
        let saving = BandwidthConfig {
            saving_mode: true,
            ..BandwidthConfig::default()
        };
        let normal = TcpBandwidthTester::new(&transport, &BandwidthConfig::default(), CancellationToken::new());
        let light = TcpBandwidthTester::new(&transport, &saving, CancellationToken::new());
        assert_eq!(normal.frame_size(), FRAME_SIZE);
        assert_eq!(light.frame_size(), SAVING_FRAME_SIZE);
    }

    #[test]
    fn test_throughput_uses_measurement_divisor() {
        assert_eq!(throughput_bps(7_000_000, 7.0), 8_000_000.0);
        assert_eq!(throughput_bps(123, 0.0), 0.0);
    }
}
