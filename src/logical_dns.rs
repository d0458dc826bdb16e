//! Logical DNS clusters: one upstream host kept bound to a DNS name.
//!
//! The cluster owns a single [`LogicalHost`] whose identity never changes.
//! Each refresh resolves the configured hostname and rebinds the host's
//! address only when the *primary* (first) resolved address differs from the
//! bound one. Secondary addresses appearing, disappearing or reordering never
//! cause a rebind, and an empty result never blanks out a working address.
//!
//! ```text
//!            construct
//!                │
//!                ▼
//!   ┌──▶ ResolutionPending ──(resolved | failed)──▶ Idle ──(timer)──┐
//!   │                                                               │
//!   └───────────────────────────────────────────────────────────────┘
//!
//!   shutdown() from any state ──▶ ShutDown (all later events ignored)
//! ```
//!
//! Initialization fires on the first completed resolution, including an empty
//! one. Failed resolutions never initialize the cluster; it keeps retrying on
//! every refresh interval until a lookup completes.

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{DnsLookupFamily, LogicalDnsClusterConfig};
use crate::error::DiscoveryError;
use crate::metrics::{self, ResolveResult};
use crate::resolver::{ActiveQuery, DnsResolver, ResolveCallback};
use crate::timer::RefreshTimer;

/// Observer of host membership changes: `(added, removed)`.
pub type MemberUpdateCallback = Arc<dyn Fn(&[Arc<LogicalHost>], &[Arc<LogicalHost>]) + Send + Sync>;

/// The single upstream endpoint of a logical DNS cluster.
///
/// Shared by reference. Holders observe rebinds without re-fetching the host
/// list.
#[derive(Debug)]
pub struct LogicalHost {
    hostname: String,
    port: u16,
    cluster_name: String,
    address: RwLock<Option<SocketAddr>>,
}

impl LogicalHost {
    fn new(hostname: String, port: u16, cluster_name: String) -> Self {
        Self {
            hostname,
            port,
            cluster_name,
            address: RwLock::new(None),
        }
    }

    /// Configured hostname.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Configured port, applied to every resolved address.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Name of the owning cluster.
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Currently bound address, `None` until the first non-empty resolution.
    pub fn address(&self) -> Option<SocketAddr> {
        *self.address.read()
    }

    fn rebind(&self, address: SocketAddr) {
        *self.address.write() = Some(address);
    }
}

/// Lifecycle state of a logical DNS cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    /// No query outstanding, waiting for the refresh timer.
    Idle {
        /// True once a resolution has completed.
        initialized: bool,
    },
    /// One query outstanding.
    ResolutionPending {
        /// True once a resolution has completed.
        initialized: bool,
    },
    /// Shut down. All events are ignored.
    ShutDown,
}

/// Parse a host URL of the form `tcp://<hostname>:<port>`.
pub fn parse_host_url(url: &str) -> Result<(String, u16), DiscoveryError> {
    let invalid = || DiscoveryError::Configuration(format!("invalid host url '{url}'"));

    let authority = url.strip_prefix("tcp://").ok_or_else(invalid)?;
    let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;

    Ok((host.to_string(), port))
}

struct PendingQuery {
    id: u64,
    token: CancellationToken,
    active: Option<ActiveQuery>,
}

impl PendingQuery {
    fn cancel(self) {
        self.token.cancel();
        if let Some(active) = self.active {
            active.cancel();
        }
    }
}

struct Shared {
    name: String,
    family: DnsLookupFamily,
    refresh_rate: Duration,
    resolver: Arc<dyn DnsResolver>,
    host: Arc<LogicalHost>,
    shutdown: CancellationToken,
    /// Held for a whole completion, user callbacks included, and by
    /// `shutdown`. Reentrant so callbacks may call back into the cluster.
    dispatch: ReentrantMutex<()>,
    state: Mutex<Inner>,
}

struct Inner {
    timer: Box<dyn RefreshTimer>,
    pending: Option<PendingQuery>,
    next_query_id: u64,
    initialized: bool,
    shut_down: bool,
    initialize_callback: Option<Box<dyn FnOnce() + Send>>,
    member_update_callbacks: Vec<MemberUpdateCallback>,
}

/// A cluster whose single host tracks the primary DNS address of a hostname.
///
/// Cloning yields another handle to the same cluster. Events must come from
/// one logical thread at a time, though `shutdown` may be called from any
/// thread. User callbacks run without the state lock held, so they may call
/// back into the cluster.
#[derive(Clone)]
pub struct LogicalDnsCluster {
    shared: Arc<Shared>,
}

impl LogicalDnsCluster {
    /// Create the cluster and issue its first resolution.
    ///
    /// Fails with [`DiscoveryError::Configuration`] unless exactly one
    /// `tcp://host:port` URL is configured. Nothing is resolved on failure.
    pub fn new(
        config: &LogicalDnsClusterConfig,
        resolver: Arc<dyn DnsResolver>,
        timer: Box<dyn RefreshTimer>,
    ) -> Result<Self, DiscoveryError> {
        let url = match config.hosts.as_slice() {
            [host] => &host.url,
            hosts => {
                return Err(DiscoveryError::Configuration(format!(
                    "logical_dns cluster '{}' requires exactly one host, got {}",
                    config.name,
                    hosts.len()
                )))
            }
        };
        let (hostname, port) = parse_host_url(url)?;

        let cluster = Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                family: config.dns_lookup_family,
                refresh_rate: config.dns_refresh_rate(),
                resolver,
                host: Arc::new(LogicalHost::new(hostname, port, config.name.clone())),
                shutdown: CancellationToken::new(),
                dispatch: ReentrantMutex::new(()),
                state: Mutex::new(Inner {
                    timer,
                    pending: None,
                    next_query_id: 0,
                    initialized: false,
                    shut_down: false,
                    initialize_callback: None,
                    member_update_callbacks: Vec::new(),
                }),
            }),
        };

        info!(
            cluster = %cluster.shared.name,
            hostname = %cluster.shared.host.hostname(),
            port,
            family = ?cluster.shared.family,
            "starting logical DNS cluster"
        );
        cluster.start_resolve();

        Ok(cluster)
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Address family used for lookups.
    pub fn dns_lookup_family(&self) -> DnsLookupFamily {
        self.shared.family
    }

    /// The logical host, bound or not.
    pub fn logical_host(&self) -> Arc<LogicalHost> {
        self.shared.host.clone()
    }

    /// Routable hosts: the logical host once it has an address.
    pub fn hosts(&self) -> Vec<Arc<LogicalHost>> {
        if self.shared.host.address().is_some() {
            vec![self.shared.host.clone()]
        } else {
            Vec::new()
        }
    }

    /// Healthy hosts. Logical hosts carry no health checks, so this equals
    /// [`hosts`](Self::hosts).
    pub fn healthy_hosts(&self) -> Vec<Arc<LogicalHost>> {
        self.hosts()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ResolverState {
        let inner = self.shared.state.lock();
        if inner.shut_down {
            ResolverState::ShutDown
        } else if inner.pending.is_some() {
            ResolverState::ResolutionPending {
                initialized: inner.initialized,
            }
        } else {
            ResolverState::Idle {
                initialized: inner.initialized,
            }
        }
    }

    /// Register an observer of membership changes.
    pub fn add_member_update_callback(
        &self,
        callback: impl Fn(&[Arc<LogicalHost>], &[Arc<LogicalHost>]) + Send + Sync + 'static,
    ) {
        let mut inner = self.shared.state.lock();
        if !inner.shut_down {
            inner.member_update_callbacks.push(Arc::new(callback));
        }
    }

    /// Register the one-shot initialization callback.
    ///
    /// Runs immediately if the cluster is already initialized.
    pub fn set_initialized_callback(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut inner = self.shared.state.lock();
            if inner.shut_down {
                return;
            }
            if !inner.initialized {
                inner.initialize_callback = Some(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Apply a completed resolution.
    pub fn on_resolved(&self, addresses: Vec<IpAddr>) {
        self.finish_cycle(None, Some(addresses));
    }

    /// Record a failed resolution and schedule the next one.
    pub fn on_resolution_failed(&self) {
        self.finish_cycle(None, None);
    }

    /// Issue the next resolution.
    pub fn on_refresh_timer_fired(&self) {
        if self.is_shut_down() {
            return;
        }
        trace!(cluster = %self.shared.name, "refresh timer fired");
        self.start_resolve();
    }

    /// Cancel any outstanding query and disarm the timer.
    ///
    /// Waits for a completion already dispatching on another thread. After
    /// this returns nothing the cluster started can mutate the host or reach
    /// an observer.
    pub fn shutdown(&self) {
        let _dispatch = self.shared.dispatch.lock();
        let pending = {
            let mut inner = self.shared.state.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.timer.disable();
            inner.initialize_callback = None;
            inner.member_update_callbacks.clear();
            inner.pending.take()
        };

        self.shared.shutdown.cancel();
        if let Some(pending) = pending {
            debug!(
                cluster = %self.shared.name,
                query = pending.id,
                "cancelling pending resolution"
            );
            pending.cancel();
        }

        info!(cluster = %self.shared.name, "logical DNS cluster shut down");
    }

    fn start_resolve(&self) {
        let (id, token) = {
            let mut inner = self.shared.state.lock();
            if inner.shut_down || inner.pending.is_some() {
                return;
            }
            inner.next_query_id += 1;
            let id = inner.next_query_id;
            let token = self.shared.shutdown.child_token();
            inner.pending = Some(PendingQuery {
                id,
                token: token.clone(),
                active: None,
            });
            (id, token)
        };

        debug!(
            cluster = %self.shared.name,
            hostname = %self.shared.host.hostname(),
            query = id,
            "starting resolution"
        );

        let weak = Arc::downgrade(&self.shared);
        let callback = ResolveCallback::new(token, move |result| {
            if let Some(cluster) = Self::upgrade(&weak) {
                cluster.complete(id, result);
            }
        });

        let active = self.shared.resolver.resolve(
            self.shared.host.hostname(),
            self.shared.family,
            callback,
        );

        let Some(active) = active else {
            return;
        };

        let mut inner = self.shared.state.lock();
        let shut_down = inner.shut_down;
        match inner.pending.as_mut() {
            Some(pending) if pending.id == id => pending.active = Some(active),
            _ if shut_down => active.cancel(),
            // Completed before the handle came back.
            _ => {}
        }
    }

    fn complete(&self, id: u64, result: Result<Vec<IpAddr>, DiscoveryError>) {
        match result {
            Ok(addresses) => self.finish_cycle(Some(id), Some(addresses)),
            Err(e) => {
                warn!(
                    cluster = %self.shared.name,
                    hostname = %self.shared.host.hostname(),
                    error = %e,
                    "resolution failed"
                );
                self.finish_cycle(Some(id), None);
            }
        }
    }

    /// Close out one cycle. `resolved` is `None` for a failed resolution.
    fn finish_cycle(&self, query_id: Option<u64>, resolved: Option<Vec<IpAddr>>) {
        let _dispatch = self.shared.dispatch.lock();

        let (observers, initialize_callback, superseded) = {
            let mut inner = self.shared.state.lock();
            if inner.shut_down {
                trace!(cluster = %self.shared.name, "ignoring resolution after shutdown");
                return;
            }
            if let Some(id) = query_id {
                if inner.pending.as_ref().map(|p| p.id) != Some(id) {
                    trace!(cluster = %self.shared.name, query = id, "ignoring stale resolution");
                    return;
                }
            }
            // A direct call closes the cycle of a query still in flight.
            let superseded = inner.pending.take().filter(|_| query_id.is_none());

            let mut observers = Vec::new();
            let mut initialize_callback = None;

            match resolved {
                Some(addresses) => {
                    metrics::record_resolved_addresses(addresses.len());
                    if self.apply_primary(addresses.first().copied()) {
                        observers = inner.member_update_callbacks.clone();
                    }
                    if !inner.initialized {
                        inner.initialized = true;
                        initialize_callback = inner.initialize_callback.take();
                    }
                }
                None => metrics::record_resolve(&self.shared.name, ResolveResult::Failure),
            }

            let on_fire = self.timer_callback();
            inner.timer.enable(self.shared.refresh_rate, on_fire);

            (observers, initialize_callback, superseded)
        };

        if let Some(pending) = superseded {
            trace!(
                cluster = %self.shared.name,
                query = pending.id,
                "cancelling superseded resolution"
            );
            pending.cancel();
        }

        // An observer may shut the cluster down.
        let added = [self.shared.host.clone()];
        for observer in &observers {
            if self.is_shut_down() {
                return;
            }
            observer(&added, &[]);
        }

        if let Some(callback) = initialize_callback {
            if self.is_shut_down() {
                return;
            }
            debug!(cluster = %self.shared.name, "initial resolution complete");
            callback();
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shut_down
    }

    /// Rebind to `primary` if it differs from the bound address.
    ///
    /// Returns `true` if the host was rebound.
    fn apply_primary(&self, primary: Option<IpAddr>) -> bool {
        let host = &self.shared.host;

        let Some(primary) = primary else {
            debug!(
                cluster = %self.shared.name,
                address = ?host.address(),
                "empty resolution, keeping current address"
            );
            metrics::record_resolve(&self.shared.name, ResolveResult::Empty);
            return false;
        };

        let address = SocketAddr::new(primary, host.port());
        if host.address() == Some(address) {
            trace!(cluster = %self.shared.name, %address, "primary address unchanged");
            metrics::record_resolve(&self.shared.name, ResolveResult::Unchanged);
            return false;
        }

        info!(
            cluster = %self.shared.name,
            hostname = %host.hostname(),
            previous = ?host.address(),
            %address,
            "rebinding logical host"
        );
        host.rebind(address);
        metrics::record_resolve(&self.shared.name, ResolveResult::Rebind);
        true
    }

    fn timer_callback(&self) -> Box<dyn FnOnce() + Send> {
        let weak = Arc::downgrade(&self.shared);
        Box::new(move || {
            if let Some(cluster) = Self::upgrade(&weak) {
                cluster.on_refresh_timer_fired();
            }
        })
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }
}

impl std::fmt::Debug for LogicalDnsCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalDnsCluster")
            .field("name", &self.shared.name)
            .field("host", &self.shared.host)
            .field("state", &self.state())
            .finish()
    }
}
