//! Service setup and lifecycle management.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cds::CdsApi;
use crate::config::{Config, LogicalDnsClusterConfig};
use crate::error::DiscoveryError;
use crate::fetcher::RestApiFetcher;
use crate::logical_dns::LogicalDnsCluster;
use crate::registry::{ClusterDefinition, ClusterManager};
use crate::resolver::{DnsResolver, HickoryDnsResolver};
use crate::timer::TokioRefreshTimer;

/// Interval for emitting registry metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit registry metrics.
async fn metrics_loop(registry: ClusterManager, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                registry.emit_metrics();
                debug!(clusters = registry.len(), "emitted registry metrics");
            }
            _ = shutdown.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// Upstream discovery service: static clusters, logical DNS clusters and CDS.
pub struct UpstreamService {
    config: Config,
    registry: ClusterManager,
    resolver: Arc<dyn DnsResolver>,
}

impl UpstreamService {
    /// Create a service resolving through hickory with default settings.
    pub fn new(config: Config) -> Self {
        Self::with_resolver(config, Arc::new(HickoryDnsResolver::default()))
    }

    /// Create a service with a custom DNS resolver.
    pub fn with_resolver(config: Config, resolver: Arc<dyn DnsResolver>) -> Self {
        let registry = ClusterManager::with_max_clusters(config.registry.max_clusters);
        Self {
            config,
            registry,
            resolver,
        }
    }

    /// Get a reference to the cluster registry.
    pub fn registry(&self) -> &ClusterManager {
        &self.registry
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Configuration errors abort the run. Discovery settings are checked
    /// before any logical DNS cluster starts, and clusters already started
    /// are shut down.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DiscoveryError> {
        for value in &self.config.static_clusters {
            self.registry
                .add_static_cluster(ClusterDefinition::from_json(value.clone())?)?;
        }

        let (init_tx, mut init_rx) = mpsc::unbounded_channel::<String>();

        let fetcher = match &self.config.cds {
            Some(cds_config) => {
                let mut cds = CdsApi::new(cds_config, Arc::new(self.registry.clone()))?;
                let tx = init_tx.clone();
                cds.set_initialized_callback(move || {
                    let _ = tx.send("cds".to_string());
                });
                Some(RestApiFetcher::new(cds_config, cds)?)
            }
            None => None,
        };

        let mut clusters = Vec::with_capacity(self.config.logical_dns_clusters.len());
        for cluster_config in &self.config.logical_dns_clusters {
            match self.start_logical_dns(cluster_config, init_tx.clone()) {
                Ok(cluster) => clusters.push(cluster),
                Err(e) => {
                    clusters.iter().for_each(LogicalDnsCluster::shutdown);
                    return Err(e);
                }
            }
        }
        drop(init_tx);

        let mut pending_init = clusters.len() + usize::from(fetcher.is_some());
        let fetcher_handle = fetcher.map(|fetcher| tokio::spawn(fetcher.run(shutdown.clone())));

        info!(
            static_clusters = self.config.static_clusters.len(),
            logical_dns_clusters = clusters.len(),
            cds = self.config.cds.is_some(),
            "Upstream discovery started"
        );

        let metrics_handle = tokio::spawn(metrics_loop(self.registry.clone(), shutdown.clone()));
        self.registry.emit_metrics();

        if pending_init == 0 {
            info!("All clusters initialized");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Upstream discovery shutdown requested");
                    break;
                }
                Some(name) = init_rx.recv(), if pending_init > 0 => {
                    pending_init -= 1;
                    debug!(component = %name, remaining = pending_init, "component initialized");
                    if pending_init == 0 {
                        info!(clusters = self.registry.len(), "All clusters initialized");
                    }
                }
            }
        }

        for cluster in &clusters {
            cluster.shutdown();
        }

        if let Some(handle) = fetcher_handle {
            if let Err(e) = handle.await {
                error!("Cluster discovery task panicked: {}", e);
            }
        }
        let _ = metrics_handle.await;

        info!("Upstream discovery stopped");
        Ok(())
    }

    fn start_logical_dns(
        &self,
        config: &LogicalDnsClusterConfig,
        init_tx: mpsc::UnboundedSender<String>,
    ) -> Result<LogicalDnsCluster, DiscoveryError> {
        let hosts: Vec<_> = config
            .hosts
            .iter()
            .map(|h| serde_json::json!({"url": h.url}))
            .collect();
        let definition = ClusterDefinition::from_json(serde_json::json!({
            "name": config.name,
            "type": "logical_dns",
            "connect_timeout_ms": config.connect_timeout_ms,
            "lb_type": "round_robin",
            "hosts": hosts,
        }))?;

        // Registered only once the cluster is valid.
        let timer = TokioRefreshTimer::new(tokio::runtime::Handle::current());
        let cluster = LogicalDnsCluster::new(config, self.resolver.clone(), Box::new(timer))?;
        if let Err(e) = self.registry.add_static_cluster(definition) {
            cluster.shutdown();
            return Err(e);
        }

        let name = config.name.clone();
        cluster.add_member_update_callback(move |added, _removed| {
            for host in added {
                info!(
                    cluster = %name,
                    hostname = %host.hostname(),
                    address = ?host.address(),
                    "logical host updated"
                );
            }
        });

        let name = config.name.clone();
        cluster.set_initialized_callback(move || {
            let _ = init_tx.send(name);
        });

        Ok(cluster)
    }
}
