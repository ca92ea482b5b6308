//! Result checks, multi-server averages and human-readable summaries.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::registry::Server;

/// Ratio beyond which one direction dwarfing the other marks a run as suspect.
const MAX_ASYMMETRY: f64 = 100.0;

/// Whether a server's download/upload pair is plausible.
///
/// A pair is implausible when both are measured and one exceeds the other
/// more than a hundredfold. Missing or zero values are not judged.
pub fn check_valid(server: &Server) -> bool {
    match (server.download_mbps, server.upload_mbps) {
        (Some(dl), Some(ul)) if dl > 0.0 && ul > 0.0 => {
            !(dl > ul * MAX_ASYMMETRY || ul > dl * MAX_ASYMMETRY)
        }
        _ => true,
    }
}

/// Mean download and upload across a set of tested servers.
///
/// A direction no server measured is `None` and left out of the JSON report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Averages {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_mbps: Option<f64>,
    pub servers: usize,
}

/// Average results over the servers passed in.
///
/// Pass only servers whose run succeeded. Each direction is averaged over
/// the servers that measured it. An empty set is [`Error::NoResults`].
pub fn average_across<'a, I>(servers: I) -> Result<Averages>
where
    I: IntoIterator<Item = &'a Server>,
{
    let mut download = Mean::default();
    let mut upload = Mean::default();
    let mut count = 0usize;
    for server in servers {
        download.add(server.download_mbps);
        upload.add(server.upload_mbps);
        count += 1;
    }

    if count == 0 {
        return Err(Error::NoResults);
    }
    Ok(Averages {
        download_mbps: download.value(),
        upload_mbps: upload.value(),
        servers: count,
    })
}

#[derive(Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn add(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.count += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

fn format_speed(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbit/s", mbps / 1000.0)
    } else {
        format!("{:.2} Mbit/s", mbps)
    }
}

/// One-line summary of a server's measurements.
pub fn format_summary(server: &Server) -> String {
    let mut summary = format!("{} ({}) by {}:", server.name, server.country, server.sponsor);

    match server.latency_ms {
        Some(ms) => summary.push_str(&format!(" latency {:.2} ms", ms)),
        None => summary.push_str(" latency -"),
    }
    if let Some(dl) = server.download_mbps {
        summary.push_str(&format!(", download {}", format_speed(dl)));
    }
    if let Some(ul) = server.upload_mbps {
        summary.push_str(&format!(", upload {}", format_speed(ul)));
    }
    summary
}

/// Summary line for a multi-server average.
pub fn format_averages(averages: &Averages) -> String {
    let mut line = format!(
        "Average over {} server{}:",
        averages.servers,
        if averages.servers == 1 { "" } else { "s" },
    );
    let mut parts = Vec::new();
    if let Some(dl) = averages.download_mbps {
        parts.push(format!("download {}", format_speed(dl)));
    }
    if let Some(ul) = averages.upload_mbps {
        parts.push(format!("upload {}", format_speed(ul)));
    }
    if parts.is_empty() {
        line.push_str(" no bandwidth measured");
    } else {
        line.push(' ');
        line.push_str(&parts.join(", "));
    }
    line
}
