use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{error, warn};

use netgauge::config::{EngineKind, LoggingConfig};
use netgauge::registry::{Server, UserInfo};
use netgauge::throughput::report::{self, Averages};
use netgauge::{NetgaugeConfig, RunOptions, Session};

#[derive(Parser)]
#[command(
    name = "netgauge",
    about = "Measure latency, download and upload speed against public speed test servers",
    version,
    long_about = None
)]
struct Cli {
    /// List available servers and exit
    #[arg(long)]
    list: bool,

    /// Server id to test (repeatable); defaults to the first listed server
    #[arg(long = "server", value_name = "ID")]
    servers: Vec<u32>,

    /// Use smaller frames and a lighter HTTP workload
    #[arg(long)]
    saving_mode: bool,

    /// JSON output for machine parsing
    #[arg(long)]
    json: bool,

    /// Local address to bind outbound connections to
    #[arg(long, value_name = "IP")]
    bind_ip: Option<IpAddr>,

    /// Skip the upload test
    #[arg(long, conflicts_with = "no_download")]
    no_upload: bool,

    /// Skip the download test
    #[arg(long)]
    no_download: bool,

    /// Probe every candidate and pick servers by latency
    #[arg(long)]
    rank: bool,

    /// Measure over HTTP instead of the TCP protocol
    #[arg(long)]
    http: bool,

    /// Config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, config: &mut NetgaugeConfig) {
        if self.saving_mode {
            config.bandwidth.saving_mode = true;
        }
        if self.http {
            config.bandwidth.engine = EngineKind::Http;
        }
        if self.rank {
            config.registry.rank_by_latency = true;
        }
        if self.bind_ip.is_some() {
            config.transport.bind_ip = self.bind_ip;
        }
        if self.log_json {
            config.logging.json = true;
        }
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            no_download: self.no_download,
            no_upload: self.no_upload,
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    timestamp: String,
    user_info: Option<&'a UserInfo>,
    servers: Vec<&'a Server>,
    #[serde(skip_serializing_if = "Option::is_none")]
    averages: Option<Averages>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve configuration under a stderr subscriber so that warnings raised
/// while loading are not lost before the real subscriber exists.
fn load_config(cli: &Cli) -> Result<NetgaugeConfig> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let resolve = || NetgaugeConfig::resolve(cli.config.as_deref());
    let config = if cli.log_json {
        tracing::subscriber::with_default(builder.json().finish(), resolve)
    } else {
        tracing::subscriber::with_default(builder.finish(), resolve)
    }?;
    Ok(config)
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli)?;
    cli.apply(&mut config);
    init_tracing(&config.logging);

    let session = Session::new(&config).context("failed to set up measurement session")?;

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping measurements");
            cancel.cancel();
        }
    });

    let user = match session.user_info().await {
        Ok(user) => Some(user),
        Err(e) => {
            warn!(error = %e, "could not determine client location");
            None
        }
    };

    let scoped = match cli.servers.as_slice() {
        [id] => Some(*id),
        _ => None,
    };
    let mut list = session.servers(scoped).await?;
    if let Some((lat, lon)) = user.as_ref().and_then(|u| u.lat.zip(u.lon)) {
        list.annotate_distance(lat, lon);
        if !config.registry.rank_by_latency {
            list.sort_by_distance();
        }
    }

    if cli.list {
        if cli.json {
            println!("{}", serde_json::to_string_pretty(list.servers())?);
        } else {
            for server in list.iter() {
                println!("{}", server);
            }
        }
        return Ok(());
    }

    if !cli.json {
        if let Some(user) = &user {
            println!("Testing from {}", user);
        }
        println!("Engine: {}", session.engine_name());
    }

    let selection = list.select(&cli.servers);
    let outcomes = session.run(&mut list, &selection, &cli.options()).await;

    let mut failures = 0;
    for outcome in &outcomes {
        let Some(server) = list.get(outcome.index) else {
            continue;
        };
        match &outcome.result {
            Ok(()) => {
                if !cli.json {
                    println!("{}", server);
                    println!("  {}", report::format_summary(server));
                }
                if !report::check_valid(server) {
                    warn!(server_id = %server.id, "download and upload differ more than a hundredfold");
                    if !cli.json {
                        println!("  Warning: result seems to be wrong, please test again.");
                    }
                }
            }
            Err(e) => {
                failures += 1;
                error!(server_id = %server.id, error = %e, "measurement failed");
            }
        }
    }

    let tested: Vec<&Server> = outcomes.iter().filter_map(|o| list.get(o.index)).collect();
    let succeeded: Vec<&Server> = outcomes
        .iter()
        .filter(|o| o.result.is_ok())
        .filter_map(|o| list.get(o.index))
        .collect();
    let averages = if succeeded.len() > 1 {
        Some(report::average_across(succeeded.iter().copied())?)
    } else {
        None
    };

    if cli.json {
        let out = JsonReport {
            timestamp: timestamp(),
            user_info: user.as_ref(),
            servers: tested,
            averages,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if let Some(averages) = &averages {
        println!("{}", report::format_averages(averages));
    }

    if !outcomes.is_empty() && failures == outcomes.len() {
        anyhow::bail!("every selected server failed");
    }
    Ok(())
}
