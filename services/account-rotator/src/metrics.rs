//! Prometheus metrics exposition
//!
//! Counters emitted by the pool crates:
//!
//! - `rotation_selections_total` (counter): label `strategy`
//! - `rotation_exhausted_total` (counter)
//! - `token_refresh_total` (counter): label `result`
//! - `probe_results_total` (counter): label `result`
//!
//! and by this service:
//!
//! - `external_sync_total` (counter): label `outcome`

use std::net::SocketAddr;

use account_pool::SyncOutcome;
use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with an HTTP scrape listener on `addr`.
/// Without an address no recorder is installed and metric calls are no-ops.
pub fn install(addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("failed to start metrics listener on {addr}"))?;
    describe();
    Ok(())
}

fn describe() {
    metrics::describe_counter!("rotation_selections_total", "Accounts selected, by strategy");
    metrics::describe_counter!(
        "rotation_exhausted_total",
        "Selections that found no account able to serve"
    );
    metrics::describe_counter!("token_refresh_total", "Refresh-token exchanges, by result");
    metrics::describe_counter!("probe_results_total", "Capacity probes, by result");
    metrics::describe_counter!("external_sync_total", "External credential file syncs, by outcome");
}

/// Record the outcome of one external credential file sync.
pub fn record_sync(outcome: &account_pool::Result<SyncOutcome>) {
    let label = match outcome {
        Ok(SyncOutcome::Unchanged) => "unchanged",
        Ok(SyncOutcome::Imported { .. }) => "imported",
        Ok(SyncOutcome::Missing) => "missing",
        Err(_) => "error",
    };
    metrics::counter!("external_sync_total", "outcome" => label).increment(1);
}
