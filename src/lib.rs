//! Upstream discovery - keeps a proxy's upstream clusters in sync with the
//! outside world.
//!
//! Two reconciliation engines feed the cluster registry the data plane reads
//! from:
//!
//! - **Cluster discovery (CDS)**: the full cluster set is fetched periodically
//!   from an HTTP discovery API and applied to the registry as a minimal set of
//!   idempotent add/update/remove operations.
//! - **Logical DNS clusters**: a single upstream host backed by a hostname is
//!   re-resolved on a timer and rebound in place only when its primary address
//!   changes, avoiding needless connection churn.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       upstream-discovery                         │
//! │                                                                  │
//! │  ┌────────────────┐   body    ┌──────────┐  upsert  ┌──────────┐  │
//! │  │ RestApiFetcher │─────────▶│  CdsApi  │────────▶│ Cluster  │  │
//! │  │ (HTTP, timer)  │  failure  │ (diff)   │  remove  │ Manager  │  │
//! │  └────────────────┘          └──────────┘          └──────────┘  │
//! │                                                                  │
//! │  ┌────────────────┐  fire    ┌───────────────────┐  resolve      │
//! │  │ RefreshTimer   │────────▶│ LogicalDnsCluster │────────▶ DNS  │
//! │  └────────────────┘          │  (stability rule) │◀──────────    │
//! │                              └─────────┬─────────┘   callback    │
//! │                                        ▼                         │
//! │                                   LogicalHost (rebind in place)  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use tokio_util::sync::CancellationToken;
//! use upstream_discovery::{Config, UpstreamService};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = toml_source_somewhere();
//!     let shutdown = CancellationToken::new();
//!
//!     let service = UpstreamService::new(config);
//!     service.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod cds;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod logical_dns;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod telemetry;
pub mod timer;

// Re-export main types
pub use cds::{CdsApi, CdsStats, CdsStatsSnapshot, FetchFailure};
pub use config::{
    CdsConfig, Config, DnsLookupFamily, HostConfig, LogicalDnsClusterConfig, RegistryConfig,
    TelemetryConfig,
};
pub use error::DiscoveryError;
pub use fetcher::RestApiFetcher;
pub use logical_dns::{LogicalDnsCluster, LogicalHost, ResolverState};
pub use registry::{ClusterDefinition, ClusterManager, ClusterRegistry};
pub use resolver::{ActiveQuery, DnsResolver, HickoryDnsResolver, ResolveCallback};
pub use service::UpstreamService;
pub use timer::{RefreshTimer, TokioRefreshTimer};
