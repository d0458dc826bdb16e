//! Cluster registry: the live set of upstream clusters.
//!
//! The registry is the source the data plane reads from. Discovery only talks
//! to it through [`ClusterRegistry`], so tests and embedders can supply their
//! own storage.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::error::DiscoveryError;
use crate::metrics;

/// A named upstream cluster definition.
///
/// Opaque beyond its name: the raw JSON object is kept so that changes to any
/// field are detected by structural comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDefinition {
    name: String,
    config: serde_json::Value,
}

impl ClusterDefinition {
    /// Build a definition from a JSON object carrying a string `name`.
    pub fn from_json(config: serde_json::Value) -> Result<Self, DiscoveryError> {
        let name = config
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                DiscoveryError::Configuration("cluster definition has no name".to_string())
            })?
            .to_string();

        Ok(Self { name, config })
    }

    /// Cluster name, unique within a registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw cluster configuration.
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }
}

/// Snapshot of registered clusters keyed by name.
pub type ClusterInfoMap = HashMap<String, Arc<ClusterDefinition>>;

/// Authoritative set of live clusters.
pub trait ClusterRegistry: Send + Sync {
    /// Snapshot of the currently registered clusters.
    fn clusters(&self) -> ClusterInfoMap;

    /// Add a cluster or replace its definition.
    ///
    /// Returns `true` if the registry changed.
    fn add_or_update_cluster(&self, definition: ClusterDefinition) -> Result<bool, DiscoveryError>;

    /// Remove a cluster by name.
    ///
    /// Returns `true` if a cluster was removed.
    fn remove_cluster(&self, name: &str) -> Result<bool, DiscoveryError>;
}

/// Thread-safe in-memory cluster registry.
#[derive(Debug, Clone, Default)]
pub struct ClusterManager {
    inner: Arc<RwLock<ClusterManagerInner>>,
}

#[derive(Debug, Default)]
struct ClusterManagerInner {
    /// name -> definition
    clusters: ClusterInfoMap,

    /// Names defined in local configuration. Not updatable through discovery.
    static_names: HashSet<String>,

    /// Upper bound on clusters, static ones included.
    max_clusters: Option<usize>,
}

impl ClusterManager {
    /// Create an empty, unbounded registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry holding at most `max_clusters` clusters.
    pub fn with_max_clusters(max_clusters: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ClusterManagerInner {
                max_clusters,
                ..Default::default()
            })),
        }
    }

    /// Register a locally configured cluster.
    ///
    /// Static clusters are visible in snapshots but discovery can neither
    /// update nor remove them.
    pub fn add_static_cluster(&self, definition: ClusterDefinition) -> Result<(), DiscoveryError> {
        let mut inner = self.inner.write();
        let name = definition.name().to_string();
        if inner.clusters.contains_key(&name) {
            return Err(DiscoveryError::Configuration(format!(
                "duplicate static cluster '{name}'"
            )));
        }
        Self::check_capacity(&inner)?;

        debug!(cluster = %name, "adding static cluster");
        inner.static_names.insert(name.clone());
        inner.clusters.insert(name, Arc::new(definition));
        Ok(())
    }

    /// Look up a cluster by name.
    pub fn get(&self, name: &str) -> Option<Arc<ClusterDefinition>> {
        self.inner.read().clusters.get(name).cloned()
    }

    /// Check whether a cluster is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().clusters.contains_key(name)
    }

    /// Sorted names of all registered clusters.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().clusters.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get count of registered clusters.
    pub fn len(&self) -> usize {
        self.inner.read().clusters.len()
    }

    /// True if no cluster is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().clusters.is_empty()
    }

    /// Emit current registry metrics.
    pub fn emit_metrics(&self) {
        let inner = self.inner.read();
        metrics::record_registry_counts(inner.clusters.len(), inner.static_names.len());
    }

    fn check_capacity(inner: &ClusterManagerInner) -> Result<(), DiscoveryError> {
        match inner.max_clusters {
            Some(max) if inner.clusters.len() >= max => Err(DiscoveryError::Registry(format!(
                "cluster limit of {max} reached"
            ))),
            _ => Ok(()),
        }
    }
}

impl ClusterRegistry for ClusterManager {
    fn clusters(&self) -> ClusterInfoMap {
        self.inner.read().clusters.clone()
    }

    fn add_or_update_cluster(&self, definition: ClusterDefinition) -> Result<bool, DiscoveryError> {
        let mut inner = self.inner.write();
        let name = definition.name();

        if inner.static_names.contains(name) {
            debug!(cluster = %name, "ignoring update of static cluster");
            return Ok(false);
        }

        match inner.clusters.get(name) {
            Some(existing) if **existing == definition => return Ok(false),
            Some(_) => {}
            None => Self::check_capacity(&inner)?,
        }

        debug!(cluster = %name, "upserting cluster");
        inner
            .clusters
            .insert(name.to_string(), Arc::new(definition));
        Ok(true)
    }

    fn remove_cluster(&self, name: &str) -> Result<bool, DiscoveryError> {
        let mut inner = self.inner.write();
        if inner.static_names.contains(name) {
            return Ok(false);
        }

        let removed = inner.clusters.remove(name).is_some();
        if removed {
            debug!(cluster = %name, "removed cluster");
        }
        Ok(removed)
    }
}
