//! Metrics instrumentation for upstream-discovery.
//!
//! All metrics are prefixed with `upstream.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// CDS update counters.
#[derive(Debug, Clone, Copy)]
pub enum CdsUpdate {
    /// A response body was handed to the reconciler.
    Attempt,
    /// A response was fully applied.
    Success,
    /// Fetch, parse or registry mutation failed.
    Failure,
}

/// Record a CDS update counter.
pub fn record_cds_update(update: CdsUpdate) {
    let name = match update {
        CdsUpdate::Attempt => "upstream.cds.update_attempt",
        CdsUpdate::Success => "upstream.cds.update_success",
        CdsUpdate::Failure => "upstream.cds.update_failure",
    };

    counter!(name).increment(1);
}

/// Registry mutation kinds applied by CDS.
#[derive(Debug, Clone, Copy)]
pub enum ClusterChange {
    /// Cluster added or its definition changed.
    AddOrUpdate,
    /// Cluster removed.
    Remove,
}

/// Record a cluster change applied by CDS.
pub fn record_cluster_change(change: ClusterChange) {
    let change_str = match change {
        ClusterChange::AddOrUpdate => "add_or_update",
        ClusterChange::Remove => "remove",
    };

    counter!("upstream.cds.cluster_change.count", "change" => change_str).increment(1);
}

/// Record duration of one discovery fetch.
pub fn record_fetch_duration(duration: std::time::Duration) {
    histogram!("upstream.cds.fetch.duration.seconds").record(duration.as_secs_f64());
}

/// Outcome of one DNS resolution cycle.
#[derive(Debug, Clone, Copy)]
pub enum ResolveResult {
    /// Primary address changed, host rebound.
    Rebind,
    /// Primary address unchanged.
    Unchanged,
    /// Resolver returned no addresses.
    Empty,
    /// Resolution failed.
    Failure,
}

/// Record a logical DNS resolution outcome.
pub fn record_resolve(cluster: &str, result: ResolveResult) {
    let result_str = match result {
        ResolveResult::Rebind => "rebind",
        ResolveResult::Unchanged => "unchanged",
        ResolveResult::Empty => "empty",
        ResolveResult::Failure => "failure",
    };

    counter!(
        "upstream.logical_dns.resolve.count",
        "cluster" => cluster.to_string(),
        "result" => result_str
    )
    .increment(1);
}

/// Record number of addresses returned by one resolution.
pub fn record_resolved_addresses(count: usize) {
    histogram!("upstream.logical_dns.resolve.addresses").record(count as f64);
}

/// Record registry size (call periodically or on change).
pub fn record_registry_counts(total: usize, static_clusters: usize) {
    gauge!("upstream.registry.clusters.count").set(total as f64);
    gauge!("upstream.registry.clusters.static").set(static_clusters as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
