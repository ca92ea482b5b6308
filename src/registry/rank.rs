//! Latency ranking: probe every candidate concurrently, then sort fastest first.

use futures::future::join_all;
use tracing::{debug, info};

use super::ServerList;
use crate::probes::LatencyProber;

/// Probe each server over its own connection and sort the list by latency.
///
/// Servers whose probe fails keep `latency_ms = None` and sort last.
/// Returns how many servers answered.
pub async fn rank_by_latency(list: &mut ServerList, prober: &LatencyProber) -> usize {
    let probes = list.iter().map(|server| {
        let host = server.host.clone();
        async move { prober.probe_host(&host).await }
    });
    let results = join_all(probes).await;

    let mut answered = 0;
    for (index, result) in results.into_iter().enumerate() {
        if let Some(server) = list.get_mut(index) {
            match result {
                Ok(ms) => {
                    server.latency_ms = Some(ms);
                    answered += 1;
                }
                Err(e) => {
                    debug!(server_id = %server.id, error = %e, "excluding server from ranking");
                    server.latency_ms = None;
                }
            }
        }
    }

    list.sort_by_latency();
    info!(
        candidates = list.len(),
        answered,
        rounds = prober.rounds(),
        "ranked servers by latency"
    );
    answered
}
