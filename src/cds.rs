//! Cluster discovery (CDS): full-set reconciliation of the cluster registry.
//!
//! Every successfully fetched response carries the complete set of clusters
//! this node should know about. [`CdsApi`] diffs it against the registry by
//! name, upserts everything in the response and removes everything that is no
//! longer listed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::CdsConfig;
use crate::error::DiscoveryError;
use crate::metrics::{self, CdsUpdate, ClusterChange};
use crate::registry::{ClusterDefinition, ClusterRegistry};

/// Cluster types accepted in a discovery response.
const CLUSTER_TYPES: &[&str] = &["static", "strict_dns", "logical_dns", "original_dst", "sds"];

/// Why a fetch did not produce a response body.
#[derive(Debug)]
pub enum FetchFailure {
    /// Connection or transport failure without a structured cause.
    Network,
    /// The fetch failed with a structured error.
    Exception(DiscoveryError),
}

/// Point-in-time copy of the CDS counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CdsStatsSnapshot {
    /// Response bodies handed to the reconciler.
    pub update_attempt: u64,
    /// Responses fully applied.
    pub update_success: u64,
    /// Failed fetches, parses and registry mutations.
    pub update_failure: u64,
}

/// Monotonic CDS counters. Cloning shares the underlying counters.
#[derive(Debug, Clone, Default)]
pub struct CdsStats {
    inner: Arc<CdsStatsInner>,
}

#[derive(Debug, Default)]
struct CdsStatsInner {
    update_attempt: AtomicU64,
    update_success: AtomicU64,
    update_failure: AtomicU64,
}

impl CdsStats {
    fn inc(&self, update: CdsUpdate) {
        let counter = match update {
            CdsUpdate::Attempt => &self.inner.update_attempt,
            CdsUpdate::Success => &self.inner.update_success,
            CdsUpdate::Failure => &self.inner.update_failure,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_cds_update(update);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> CdsStatsSnapshot {
        CdsStatsSnapshot {
            update_attempt: self.inner.update_attempt.load(Ordering::Relaxed),
            update_success: self.inner.update_success.load(Ordering::Relaxed),
            update_failure: self.inner.update_failure.load(Ordering::Relaxed),
        }
    }
}

/// Parse a discovery response into cluster definitions, in response order.
///
/// The body must be a JSON object with a `clusters` array. Every cluster needs
/// a non-empty string `name`, a known string `type`, an unsigned
/// `connect_timeout_ms` and a string `lb_type`. Names must be unique.
pub fn parse_response(body: &str) -> Result<Vec<ClusterDefinition>, DiscoveryError> {
    let root: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| DiscoveryError::MalformedResponse(format!("invalid JSON: {e}")))?;

    let clusters = root
        .as_object()
        .ok_or_else(|| malformed("response is not an object"))?
        .get("clusters")
        .ok_or_else(|| malformed("missing 'clusters'"))?
        .as_array()
        .ok_or_else(|| malformed("'clusters' is not an array"))?;

    let mut seen = HashSet::with_capacity(clusters.len());
    let mut definitions = Vec::with_capacity(clusters.len());

    for (idx, cluster) in clusters.iter().enumerate() {
        let obj = cluster
            .as_object()
            .ok_or_else(|| malformed(format!("clusters[{idx}] is not an object")))?;

        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| malformed(format!("clusters[{idx}] has no name")))?;

        match obj.get("type").and_then(|v| v.as_str()) {
            Some(t) if CLUSTER_TYPES.contains(&t) => {}
            Some(t) => return Err(malformed(format!("cluster '{name}' has unknown type '{t}'"))),
            None => return Err(malformed(format!("cluster '{name}' has no type"))),
        }

        if obj.get("connect_timeout_ms").and_then(|v| v.as_u64()).is_none() {
            return Err(malformed(format!(
                "cluster '{name}' has no valid connect_timeout_ms"
            )));
        }

        if obj.get("lb_type").and_then(|v| v.as_str()).is_none() {
            return Err(malformed(format!("cluster '{name}' has no lb_type")));
        }

        if !seen.insert(name.to_string()) {
            return Err(malformed(format!("duplicate cluster '{name}'")));
        }

        definitions.push(ClusterDefinition::from_json(cluster.clone())?);
    }

    Ok(definitions)
}

fn malformed(msg: impl Into<String>) -> DiscoveryError {
    DiscoveryError::MalformedResponse(msg.into())
}

/// Reconciles the cluster registry with discovery responses.
pub struct CdsApi {
    registry: Arc<dyn ClusterRegistry>,
    stats: CdsStats,
    request_path: String,
    initialize_callback: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CdsApi {
    /// Create a reconciler for the local node described by `config`.
    pub fn new(
        config: &CdsConfig,
        registry: Arc<dyn ClusterRegistry>,
    ) -> Result<Self, DiscoveryError> {
        if config.service_cluster.is_empty() || config.service_node.is_empty() {
            return Err(DiscoveryError::Configuration(
                "cds requires service_cluster and service_node to be set".to_string(),
            ));
        }

        Ok(Self {
            registry,
            stats: CdsStats::default(),
            request_path: format!(
                "/v1/clusters/{}/{}",
                config.service_cluster, config.service_node
            ),
            initialize_callback: None,
        })
    }

    /// Path of the discovery request for this node.
    pub fn request_path(&self) -> &str {
        &self.request_path
    }

    /// Counters for this reconciler.
    pub fn stats(&self) -> CdsStats {
        self.stats.clone()
    }

    /// Register the callback fired after the first applied response.
    pub fn set_initialized_callback(&mut self, callback: impl FnOnce() + Send + Sync + 'static) {
        self.initialize_callback = Some(Box::new(callback));
    }

    /// Apply a fetched response body.
    ///
    /// On a parse failure the registry is left untouched. The error is also
    /// counted and logged here, so callers only need it for their own control
    /// flow.
    pub fn on_fetch_succeeded(&mut self, body: &str) -> Result<(), DiscoveryError> {
        self.stats.inc(CdsUpdate::Attempt);
        debug!("cds: parsing response");

        let clusters = match parse_response(body) {
            Ok(clusters) => clusters,
            Err(e) => {
                self.stats.inc(CdsUpdate::Failure);
                warn!(error = %e, "cds: rejecting response");
                return Err(e);
            }
        };

        if let Err(e) = self.apply(clusters) {
            self.stats.inc(CdsUpdate::Failure);
            warn!(error = %e, "cds: registry update failed");
            return Err(e);
        }

        self.stats.inc(CdsUpdate::Success);

        if let Some(callback) = self.initialize_callback.take() {
            debug!("cds: initial fetch complete");
            callback();
        }

        Ok(())
    }

    /// Record a failed fetch. The registry is not touched.
    ///
    /// Counts as an attempt, so every fetch cycle increments `update_attempt`
    /// exactly once whatever its outcome.
    pub fn on_fetch_failed(&mut self, failure: FetchFailure) {
        self.stats.inc(CdsUpdate::Attempt);
        self.stats.inc(CdsUpdate::Failure);
        match failure {
            FetchFailure::Exception(e) => warn!(error = %e, "cds: fetch failure"),
            FetchFailure::Network => info!("cds: fetch failure: network error"),
        }
    }

    fn apply(&self, clusters: Vec<ClusterDefinition>) -> Result<(), DiscoveryError> {
        let mut clusters_to_remove = self.registry.clusters();

        for cluster in clusters {
            let name = cluster.name().to_string();
            clusters_to_remove.remove(&name);
            if self.registry.add_or_update_cluster(cluster)? {
                info!(cluster = %name, "cds: add/update cluster");
                metrics::record_cluster_change(ClusterChange::AddOrUpdate);
            }
        }

        for name in clusters_to_remove.keys() {
            if self.registry.remove_cluster(name)? {
                info!(cluster = %name, "cds: remove cluster");
                metrics::record_cluster_change(ClusterChange::Remove);
            }
        }

        Ok(())
    }
}
