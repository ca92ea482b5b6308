//! TOML configuration for a netgauge run.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working configuration. The file location can be given
//! explicitly, through `NETGAUGE_CONFIG`, or at the standard system path.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "NETGAUGE_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/netgauge/netgauge.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a measurement run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetgaugeConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub bandwidth: BandwidthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetgaugeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded netgauge configuration");
        Ok(config)
    }

    /// Resolve the configuration for this run.
    ///
    /// An explicit path must load; anything else falls back in order:
    /// 1. The path in the `NETGAUGE_CONFIG` environment variable.
    /// 2. `/etc/netgauge/netgauge.toml`.
    /// 3. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "NETGAUGE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(&system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Where the server list comes from and how candidates are ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Server list endpoint; `?serverid=<id>` is appended when scoped.
    pub url: String,
    /// Legacy config endpoint carrying the client's IP and coordinates.
    pub user_info_url: String,
    /// Probe every candidate and sort by latency before selection.
    pub rank_by_latency: bool,
    /// Ping round trips per candidate while ranking.
    pub rank_rounds: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "https://cli.speedtest.net/api/cli/config".to_string(),
            user_info_url: "https://www.speedtest.net/speedtest-config.php".to_string(),
            rank_by_latency: false,
            rank_rounds: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Socket and HTTP client settings shared by every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local address outbound connections are bound to.
    pub bind_ip: Option<IpAddr>,
    pub connect_timeout_secs: u64,
    /// Upper bound on a single socket read or write.
    pub io_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub tls_handshake_timeout_secs: u64,
    /// Upper bound on a whole HTTP request, body included.
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_ip: None,
            connect_timeout_secs: 30,
            io_timeout_secs: 10,
            keepalive_secs: 30,
            tls_handshake_timeout_secs: 10,
            request_timeout_secs: 60,
            user_agent: format!("netgauge/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Bandwidth
// ---------------------------------------------------------------------------

/// Which transport carries the download/upload sub-tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Raw TCP text protocol against the server's `host:port`.
    Tcp,
    /// HTTP GET/POST against the server's `/speedtest/` URLs.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    pub engine: EngineKind,
    /// Parallel connections per download/upload sub-test.
    pub connections: usize,
    /// Smaller frames (TCP) or a fixed light workload (HTTP).
    pub saving_mode: bool,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Tcp,
            connections: 10,
            saving_mode: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`),
    /// used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
