//! netgauge -- Internet speed measurement against a public server registry.
//!
//! The crate fetches candidate servers, selects targets by id, distance or
//! probed latency, and measures latency, download and upload throughput over
//! the servers' line-oriented TCP protocol (or an HTTP fallback).

pub mod config;
pub mod error;
pub mod probes;
pub mod registry;
pub mod throughput;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod test_support;

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use config::NetgaugeConfig;
pub use error::{Error, Result};
pub use probes::LatencyProber;
pub use registry::{Registry, Selection, Server, ServerList, UserInfo};
pub use throughput::BandwidthEngine;
pub use transport::Transport;

/// Which sub-tests to skip on each target.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub no_download: bool,
    pub no_upload: bool,
}

/// Result of testing one selected server.
#[derive(Debug)]
pub struct Outcome {
    /// Position of the server in the list it was selected from.
    pub index: usize,
    pub result: Result<()>,
}

/// Everything one measurement run needs, built once from configuration.
pub struct Session {
    registry: Registry,
    prober: LatencyProber,
    ranker: Option<LatencyProber>,
    engine: Box<dyn BandwidthEngine>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(config: &NetgaugeConfig) -> Result<Self> {
        if config.bandwidth.connections == 0 {
            return Err(Error::Config("bandwidth.connections must be at least 1".to_string()));
        }
        if config.registry.rank_by_latency && config.registry.rank_rounds == 0 {
            return Err(Error::Config("registry.rank_rounds must be at least 1".to_string()));
        }

        let transport = Transport::new(&config.transport)?;
        let cancel = CancellationToken::new();
        let engine = throughput::build_engine(&transport, &config.bandwidth, cancel.clone());
        let prober = LatencyProber::new(&transport).with_cancel(cancel.clone());
        let ranker = config
            .registry
            .rank_by_latency
            .then(|| prober.clone().with_rounds(config.registry.rank_rounds));

        info!(
            engine = engine.name(),
            connections = config.bandwidth.connections,
            saving_mode = config.bandwidth.saving_mode,
            rank_by_latency = ranker.is_some(),
            "session ready"
        );

        Ok(Self {
            registry: Registry::new(transport, &config.registry),
            prober,
            ranker,
            engine,
            cancel,
        })
    }

    /// Replace the bandwidth engine.
    pub fn with_engine(mut self, engine: Box<dyn BandwidthEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Token that stops in-flight sub-tests when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn user_info(&self) -> Result<UserInfo> {
        self.until_cancelled(self.registry.user_info()).await
    }

    /// Fetch the server list and, when ranking is enabled, order it by
    /// probed latency.
    pub async fn servers(&self, server_id: Option<u32>) -> Result<ServerList> {
        self.until_cancelled(async {
            let mut list = self.registry.fetch(server_id).await?;
            if let Some(ranker) = &self.ranker {
                registry::rank::rank_by_latency(&mut list, ranker).await;
            }
            Ok(list)
        })
        .await
    }

    async fn until_cancelled<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(Error::Cancelled),

            result = fut => result,
        }
    }

    /// Ping, then download, then upload against one server, filling in its
    /// result fields as each sub-test completes.
    ///
    /// An unanswered ping leaves `latency_ms` unset and the bandwidth tests
    /// still run; any other error ends the server's run.
    pub async fn run_server(&self, server: &mut Server, options: &RunOptions) -> Result<()> {
        match self.prober.probe_host(&server.host).await {
            Ok(ms) => server.latency_ms = Some(ms),
            Err(e @ Error::NoResponse { .. }) => {
                warn!(server_id = %server.id, error = %e, "latency unavailable");
                server.latency_ms = None;
            }
            Err(e) => return Err(e),
        }

        if !options.no_download && !self.cancel.is_cancelled() {
            server.download_mbps = Some(self.engine.download(server).await?);
        }
        if !options.no_upload && !self.cancel.is_cancelled() {
            server.upload_mbps = Some(self.engine.upload(server).await?);
        }

        info!(
            server_id = %server.id,
            latency_ms = ?server.latency_ms,
            download_mbps = ?server.download_mbps,
            upload_mbps = ?server.upload_mbps,
            "server run complete"
        );
        Ok(())
    }

    /// Test every selected server in order.
    ///
    /// A failing server does not stop the others; stops early only on
    /// cancellation.
    pub async fn run(&self, list: &mut ServerList, selection: &Selection, options: &RunOptions) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(selection.len());
        for &index in selection.indices() {
            if self.cancel.is_cancelled() {
                warn!(remaining = selection.len() - outcomes.len(), "run cancelled");
                break;
            }
            let Some(server) = list.get_mut(index) else {
                continue;
            };
            let result = self.run_server(server, options).await;
            if let Err(e) = &result {
                warn!(server_id = %server.id, error = %e, "server run failed");
            }
            outcomes.push(Outcome { index, result });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::test_support::{server_at, spawn_ping_peer};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Calls {
        download: AtomicUsize,
        upload: AtomicUsize,
    }

    struct FixedEngine {
        calls: Arc<Calls>,
        fail_upload: bool,
    }

    #[async_trait]
    impl BandwidthEngine for FixedEngine {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn download(&self, _server: &Server) -> Result<f64> {
            self.calls.download.fetch_add(1, Ordering::SeqCst);
            Ok(93.5)
        }

        async fn upload(&self, server: &Server) -> Result<f64> {
            self.calls.upload.fetch_add(1, Ordering::SeqCst);
            if self.fail_upload {
                return Err(Error::connect(&server.host, "refused"));
            }
            Ok(11.25)
        }
    }

    fn session(fail_upload: bool) -> (Session, Arc<Calls>) {
        let config = NetgaugeConfig {
            transport: TransportConfig {
                io_timeout_secs: 2,
                ..TransportConfig::default()
            },
            ..NetgaugeConfig::default()
        };
        let calls = Arc::new(Calls::default());
        let engine = FixedEngine {
            calls: calls.clone(),
            fail_upload,
        };
        let session = Session::new(&config).unwrap().with_engine(Box::new(engine));
        (session, calls)
    }

    async fn dead_host() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        drop(listener);
        host
    }

    #[tokio::test]
    async fn test_run_server_fills_every_field() {
        let host = spawn_ping_peer(Duration::from_millis(5)).await;
        let (session, calls) = session(false);
        let mut server = server_at("1", &host);

        session.run_server(&mut server, &RunOptions::default()).await.unwrap();

        assert!(server.latency_ms.unwrap() >= 5.0);
        assert_eq!(server.download_mbps, Some(93.5));
        assert_eq!(server.upload_mbps, Some(11.25));
        assert_eq!(calls.download.load(Ordering::SeqCst), 1);
        assert_eq!(calls.upload.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_server_honours_skips() {
        let host = spawn_ping_peer(Duration::from_millis(1)).await;
        let (session, calls) = session(false);
        let mut server = server_at("1", &host);

        let options = RunOptions {
            no_upload: true,
            ..RunOptions::default()
        };
        session.run_server(&mut server, &options).await.unwrap();

        assert_eq!(server.download_mbps, Some(93.5));
        assert!(server.upload_mbps.is_none());
        assert_eq!(calls.upload.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_isolates_failing_servers() {
        let live = spawn_ping_peer(Duration::from_millis(1)).await;
        let dead = dead_host().await;
        let (session, _) = session(false);

        let mut list = ServerList::new(vec![server_at("1", &dead), server_at("2", &live)]).unwrap();
        let selection = list.select(&[1, 2]);
        let outcomes = session.run(&mut list, &selection, &RunOptions::default()).await;

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0].result, Err(Error::Connect { .. })));
        assert!(outcomes[1].result.is_ok());
        assert!(list.get(0).unwrap().download_mbps.is_none());
        assert_eq!(list.get(1).unwrap().download_mbps, Some(93.5));
    }

    #[tokio::test]
    async fn test_engine_error_keeps_earlier_results() {
        let host = spawn_ping_peer(Duration::from_millis(1)).await;
        let (session, _) = session(true);
        let mut server = server_at("1", &host);

        let err = session.run_server(&mut server, &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
        assert_eq!(server.download_mbps, Some(93.5));
        assert!(server.upload_mbps.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_session_runs_nothing() {
        let host = spawn_ping_peer(Duration::from_millis(1)).await;
        let (session, calls) = session(false);
        session.cancel_token().cancel();

        let mut list = ServerList::new(vec![server_at("1", &host)]).unwrap();
        let selection = list.find(None);
        let outcomes = session.run(&mut list, &selection, &RunOptions::default()).await;

        assert!(outcomes.is_empty());
        assert_eq!(calls.download.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_abandons_stalled_registry_fetch() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"servers": []}"#)
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&mock)
            .await;

        let mut config = NetgaugeConfig::default();
        config.registry.url = format!("{}/api/cli/config", mock.uri());
        let session = Session::new(&config).unwrap();
        let trigger = session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = session.servers(None).await;
        assert!(matches!(result, Err(Error::Cancelled)), "got {:?}", result);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_zero_connections_is_config_error() {
        let mut config = NetgaugeConfig::default();
        config.bandwidth.connections = 0;
        assert!(matches!(Session::new(&config), Err(Error::Config(_))));
    }
}
