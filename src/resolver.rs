//! DNS resolver abstraction and the hickory-backed implementation.

use hickory_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver;
use std::net::IpAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::DnsLookupFamily;
use crate::error::DiscoveryError;

type CompletionFn = Box<dyn FnOnce(Result<Vec<IpAddr>, DiscoveryError>) + Send>;

/// Completion for one resolve call.
///
/// Consumed on use, so a resolver can deliver at most one result. Results
/// delivered after the token was cancelled are dropped.
pub struct ResolveCallback {
    token: CancellationToken,
    on_complete: CompletionFn,
}

impl ResolveCallback {
    /// Wrap `on_complete`, guarded by `token`.
    pub fn new(
        token: CancellationToken,
        on_complete: impl FnOnce(Result<Vec<IpAddr>, DiscoveryError>) + Send + 'static,
    ) -> Self {
        Self {
            token,
            on_complete: Box::new(on_complete),
        }
    }

    /// Token cancelled when the query is abandoned.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True if the query was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Deliver the result, unless the query was cancelled.
    pub fn complete(self, result: Result<Vec<IpAddr>, DiscoveryError>) {
        if self.token.is_cancelled() {
            trace!("dropping result of cancelled query");
            return;
        }
        (self.on_complete)(result);
    }
}

impl std::fmt::Debug for ResolveCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolveCallback")
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// Handle to an in-flight query.
#[derive(Debug)]
pub struct ActiveQuery {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ActiveQuery {
    /// Handle cancelling `token` and, if given, aborting `task`.
    pub fn new(token: CancellationToken, task: Option<JoinHandle<()>>) -> Self {
        Self { token, task }
    }

    /// Cancel the query. Its callback will not run afterwards.
    pub fn cancel(self) {
        self.token.cancel();
        if let Some(task) = self.task {
            task.abort();
        }
    }
}

/// Asynchronous hostname resolution.
pub trait DnsResolver: Send + Sync {
    /// Resolve `hostname`, delivering the ordered address list to `callback`.
    ///
    /// Returns `None` if the callback already ran before returning, otherwise
    /// a handle that cancels the outstanding query.
    fn resolve(
        &self,
        hostname: &str,
        family: DnsLookupFamily,
        callback: ResolveCallback,
    ) -> Option<ActiveQuery>;
}

/// Resolver backed by hickory, running each lookup as a tokio task.
#[derive(Clone)]
pub struct HickoryDnsResolver {
    v4_only: Resolver<TokioConnectionProvider>,
    v6_only: Resolver<TokioConnectionProvider>,
    auto: Resolver<TokioConnectionProvider>,
}

impl HickoryDnsResolver {
    /// Build resolvers for every lookup family from `config`.
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            v4_only: build_resolver(config.clone(), DnsLookupFamily::V4Only),
            v6_only: build_resolver(config.clone(), DnsLookupFamily::V6Only),
            auto: build_resolver(config, DnsLookupFamily::Auto),
        }
    }

    fn resolver_for(&self, family: DnsLookupFamily) -> &Resolver<TokioConnectionProvider> {
        match family {
            DnsLookupFamily::V4Only => &self.v4_only,
            DnsLookupFamily::V6Only => &self.v6_only,
            DnsLookupFamily::Auto => &self.auto,
        }
    }
}

impl Default for HickoryDnsResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

/// Map a lookup family to hickory's IP strategy.
pub fn lookup_strategy(family: DnsLookupFamily) -> LookupIpStrategy {
    match family {
        DnsLookupFamily::V4Only => LookupIpStrategy::Ipv4Only,
        DnsLookupFamily::V6Only => LookupIpStrategy::Ipv6Only,
        DnsLookupFamily::Auto => LookupIpStrategy::Ipv6thenIpv4,
    }
}

fn build_resolver(
    config: ResolverConfig,
    family: DnsLookupFamily,
) -> Resolver<TokioConnectionProvider> {
    let mut opts = ResolverOpts::default();
    opts.ip_strategy = lookup_strategy(family);

    Resolver::builder_with_config(config, TokioConnectionProvider::default())
        .with_options(opts)
        .build()
}

impl DnsResolver for HickoryDnsResolver {
    fn resolve(
        &self,
        hostname: &str,
        family: DnsLookupFamily,
        callback: ResolveCallback,
    ) -> Option<ActiveQuery> {
        let resolver = self.resolver_for(family).clone();
        let hostname = hostname.to_string();
        let token = callback.token().clone();
        let task_token = token.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = task_token.cancelled() => {
                    trace!(hostname = %hostname, "resolution cancelled");
                }

                result = resolver.lookup_ip(hostname.as_str()) => {
                    let result = match result {
                        Ok(lookup) => Ok(lookup.iter().collect::<Vec<IpAddr>>()),
                        Err(e) => {
                            debug!(hostname = %hostname, error = %e, "lookup failed");
                            Err(DiscoveryError::from(e))
                        }
                    };
                    callback.complete(result);
                }
            }
        });

        Some(ActiveQuery::new(token, Some(task)))
    }
}
