//! Configuration types for upstream-discovery.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cluster discovery API configuration. Discovery is disabled when absent.
    #[serde(default)]
    pub cds: Option<CdsConfig>,

    /// Clusters whose single host is kept bound through DNS.
    #[serde(default)]
    pub logical_dns_clusters: Vec<LogicalDnsClusterConfig>,

    /// Clusters defined locally. Discovery never updates or removes them.
    #[serde(default)]
    pub static_clusters: Vec<serde_json::Value>,

    /// Cluster registry limits.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Cluster discovery (CDS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdsConfig {
    /// Base URL of the discovery server (e.g., "http://127.0.0.1:8500").
    pub server: String,

    /// Name of the service cluster this proxy belongs to.
    pub service_cluster: String,

    /// Name of this proxy node.
    pub service_node: String,

    /// Delay between fetches in milliseconds.
    #[serde(default = "default_refresh_delay_ms")]
    pub refresh_delay_ms: u64,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl CdsConfig {
    /// Delay between fetches.
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Address family preference for DNS lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsLookupFamily {
    /// Only A records.
    #[default]
    V4Only,
    /// Only AAAA records.
    V6Only,
    /// AAAA first, falling back to A.
    Auto,
}

/// A configured upstream host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host URL in the form `tcp://<hostname>:<port>`.
    pub url: String,
}

/// Logical DNS cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalDnsClusterConfig {
    /// Cluster name.
    pub name: String,

    /// Hosts backing the cluster. Exactly one is accepted.
    pub hosts: Vec<HostConfig>,

    /// Address family used when resolving the host.
    #[serde(default)]
    pub dns_lookup_family: DnsLookupFamily,

    /// Interval between resolutions in milliseconds.
    #[serde(default = "default_dns_refresh_rate_ms")]
    pub dns_refresh_rate_ms: u64,

    /// Connect timeout for the logical host in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl LogicalDnsClusterConfig {
    /// Interval between resolutions.
    pub fn dns_refresh_rate(&self) -> Duration {
        Duration::from_millis(self.dns_refresh_rate_ms)
    }
}

/// Cluster registry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Upper bound on registered clusters, static ones included.
    #[serde(default)]
    pub max_clusters: Option<usize>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "upstream_discovery=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_refresh_delay_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    1_000
}

fn default_dns_refresh_rate_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    250
}
