//! Periodic discovery plus concurrent probing of every discovered endpoint.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::{DiscoveryError, EndpointDiscovery, SrvResolver};
use crate::pacing::Pacing;
use crate::probe::{is_benign, ProbeClient};

/// Outcome of one completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Endpoints probed, including failed ones.
    pub probed: usize,
    /// Probes that ended with a logged error.
    pub failed: usize,
}

/// Run one discovery cycle.
///
/// A discovery failure is returned without probing anything. Otherwise one
/// probe task is spawned per endpoint and all of them are joined before
/// returning; individual probe failures are logged and counted but never
/// fail the cycle.
pub async fn run_cycle<R: SrvResolver>(
    discovery: &EndpointDiscovery<R>,
    client: Arc<ProbeClient>,
    payload_len: usize,
) -> Result<CycleSummary, DiscoveryError> {
    let endpoints = discovery.discover().await?;

    let mut probes = JoinSet::new();
    for endpoint in endpoints {
        let client = client.clone();
        probes.spawn(async move {
            let destination = endpoint.to_string();
            let result = client.probe(&destination, payload_len).await;
            (destination, result)
        });
    }

    let mut summary = CycleSummary::default();
    while let Some(joined) = probes.join_next().await {
        summary.probed += 1;

        match joined {
            Ok((destination, Ok(_))) => debug!(%destination, "probe completed"),
            Ok((destination, Err(e))) => {
                if is_benign(&e) {
                    debug!(%destination, "peer closed connection early");
                } else {
                    summary.failed += 1;
                    error!(error = %format!("{e:#}"), %destination, "probe failed");
                }
            }
            Err(e) => {
                summary.failed += 1;
                error!(error = %e, "probe task panicked");
            }
        }
    }

    Ok(summary)
}

/// Repeat [`run_cycle`] `times` times (0 = forever), sleeping between cycles,
/// until `cancel` fires.
///
/// A discovery failure ends that cycle only; the loop carries on.
pub async fn run_cycles<R: SrvResolver>(
    discovery: &EndpointDiscovery<R>,
    client: Arc<ProbeClient>,
    payload_len: usize,
    times: u64,
    pacing: Pacing,
    cancel: CancellationToken,
) {
    let record = discovery.query().record_name();
    let mut completed: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("cycle loop stopped");
                return;
            }
            result = run_cycle(discovery, client.clone(), payload_len) => match result {
                Ok(summary) => info!(
                    %record,
                    probed = summary.probed,
                    failed = summary.failed,
                    "cycle finished",
                ),
                Err(e) => warn!(error = %e, "skipping cycle"),
            },
        }

        if times != 0 {
            completed += 1;
            if completed >= times {
                info!(cycles = completed, "finished sending");
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("cycle loop stopped");
                return;
            }
            _ = pacing.sleep() => {}
        }
    }
}
