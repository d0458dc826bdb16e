//! Shared test infrastructure for discovery integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use upstream_discovery::config::{DnsLookupFamily, HostConfig, LogicalDnsClusterConfig};
use upstream_discovery::registry::{
    ClusterDefinition, ClusterInfoMap, ClusterManager, ClusterRegistry,
};
use upstream_discovery::resolver::{ActiveQuery, DnsResolver, ResolveCallback};
use upstream_discovery::timer::{RefreshTimer, TimerCallback};
use upstream_discovery::{CdsConfig, DiscoveryError};

// --- Constants ---

pub const HOSTNAME: &str = "foo.bar.com";
pub const PORT: u16 = 443;
pub const REFRESH_RATE_MS: u64 = 4000;

// --- Address helpers ---

pub fn ips(addrs: &[&str]) -> Vec<IpAddr> {
    addrs.iter().map(|a| a.parse().unwrap()).collect()
}

pub fn sock(ip: &str) -> SocketAddr {
    SocketAddr::new(ip.parse().unwrap(), PORT)
}

// --- Config builders ---

pub fn logical_dns_config(family: DnsLookupFamily) -> LogicalDnsClusterConfig {
    LogicalDnsClusterConfig {
        name: "name".to_string(),
        hosts: vec![HostConfig {
            url: format!("tcp://{HOSTNAME}:{PORT}"),
        }],
        dns_lookup_family: family,
        dns_refresh_rate_ms: REFRESH_RATE_MS,
        connect_timeout_ms: 250,
    }
}

pub fn cds_config(server: &str) -> CdsConfig {
    CdsConfig {
        server: server.to_string(),
        service_cluster: "edge".to_string(),
        service_node: "node-1".to_string(),
        refresh_delay_ms: 50,
        request_timeout_ms: 1_000,
    }
}

// --- MockResolver ---

/// Resolver that parks callbacks until the test answers them.
///
/// Responses queued with `respond_inline` are delivered from inside
/// `resolve`, mimicking a resolver that completes synchronously.
#[derive(Clone, Default)]
pub struct MockResolver {
    inner: Arc<Mutex<MockResolverInner>>,
}

#[derive(Default)]
struct MockResolverInner {
    calls: Vec<(String, DnsLookupFamily)>,
    pending: Option<ResolveCallback>,
    tokens: Vec<CancellationToken>,
    inline: VecDeque<Vec<IpAddr>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next resolve call synchronously with `addrs`.
    pub fn respond_inline(&self, addrs: &[&str]) {
        self.inner.lock().unwrap().inline.push_back(ips(addrs));
    }

    /// Number of resolve calls so far.
    pub fn calls(&self) -> usize {
        self.inner.lock().unwrap().calls.len()
    }

    /// Hostname and family of the last resolve call.
    pub fn last_call(&self) -> Option<(String, DnsLookupFamily)> {
        self.inner.lock().unwrap().calls.last().cloned()
    }

    /// True if a callback is parked.
    pub fn has_pending(&self) -> bool {
        self.inner.lock().unwrap().pending.is_some()
    }

    /// True if the most recently issued query was cancelled.
    pub fn last_query_cancelled(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .last()
            .is_some_and(|t| t.is_cancelled())
    }

    /// Take the parked callback without completing it.
    pub fn take_pending(&self) -> ResolveCallback {
        self.inner
            .lock()
            .unwrap()
            .pending
            .take()
            .expect("no pending resolve call")
    }

    /// Complete the parked query with `addrs`.
    pub fn respond(&self, addrs: &[&str]) {
        self.take_pending().complete(Ok(ips(addrs)));
    }

    /// Fail the parked query.
    pub fn fail(&self) {
        self.take_pending()
            .complete(Err(DiscoveryError::Transport("timeout".to_string())));
    }
}

impl DnsResolver for MockResolver {
    fn resolve(
        &self,
        hostname: &str,
        family: DnsLookupFamily,
        callback: ResolveCallback,
    ) -> Option<ActiveQuery> {
        let inline = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push((hostname.to_string(), family));
            inner.tokens.push(callback.token().clone());
            match inner.inline.pop_front() {
                Some(addrs) => Some(addrs),
                None => {
                    let token = callback.token().clone();
                    inner.pending = Some(callback);
                    return Some(ActiveQuery::new(token, None));
                }
            }
        };

        if let Some(addrs) = inline {
            callback.complete(Ok(addrs));
        }
        None
    }
}

// --- ManualTimer ---

/// Timer the test fires by hand.
#[derive(Clone, Default)]
pub struct ManualTimer {
    inner: Arc<Mutex<ManualTimerInner>>,
}

#[derive(Default)]
struct ManualTimerInner {
    callback: Option<TimerCallback>,
    enables: Vec<Duration>,
    disables: usize,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Boxed handle sharing state with `self`, for handing to a cluster.
    pub fn boxed(&self) -> Box<dyn RefreshTimer> {
        Box::new(self.clone())
    }

    /// Delays passed to `enable`, in order.
    pub fn enables(&self) -> Vec<Duration> {
        self.inner.lock().unwrap().enables.clone()
    }

    pub fn disables(&self) -> usize {
        self.inner.lock().unwrap().disables
    }

    pub fn is_armed(&self) -> bool {
        self.inner.lock().unwrap().callback.is_some()
    }

    /// Disarm and return the countdown callback without running it.
    pub fn take_callback(&self) -> TimerCallback {
        self.inner
            .lock()
            .unwrap()
            .callback
            .take()
            .expect("timer not armed")
    }

    /// Fire the armed countdown.
    pub fn fire(&self) {
        let callback = self.take_callback();
        callback();
    }
}

impl RefreshTimer for ManualTimer {
    fn enable(&mut self, delay: Duration, on_fire: TimerCallback) {
        let mut inner = self.inner.lock().unwrap();
        inner.enables.push(delay);
        inner.callback = Some(on_fire);
    }

    fn disable(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        inner.disables += 1;
        inner.callback = None;
    }

    fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap().callback.is_some()
    }
}

// --- ReadyWatcher ---

/// Counts how many times a callback ran.
#[derive(Clone, Default)]
pub struct ReadyWatcher {
    count: Arc<AtomicUsize>,
}

impl ReadyWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

// --- RecordingRegistry ---

/// Registry mutation observed by [`RecordingRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryOp {
    Upsert { name: String, changed: bool },
    Remove { name: String, removed: bool },
}

/// `ClusterManager` wrapper recording every call in order.
#[derive(Clone, Default)]
pub struct RecordingRegistry {
    pub manager: ClusterManager,
    ops: Arc<Mutex<Vec<RegistryOp>>>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> Vec<RegistryOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    /// Upserts and removals that changed the registry.
    pub fn changes(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| {
                matches!(
                    op,
                    RegistryOp::Upsert { changed: true, .. }
                        | RegistryOp::Remove { removed: true, .. }
                )
            })
            .count()
    }
}

impl ClusterRegistry for RecordingRegistry {
    fn clusters(&self) -> ClusterInfoMap {
        self.manager.clusters()
    }

    fn add_or_update_cluster(&self, definition: ClusterDefinition) -> Result<bool, DiscoveryError> {
        let name = definition.name().to_string();
        let changed = self.manager.add_or_update_cluster(definition)?;
        self.ops
            .lock()
            .unwrap()
            .push(RegistryOp::Upsert { name, changed });
        Ok(changed)
    }

    fn remove_cluster(&self, name: &str) -> Result<bool, DiscoveryError> {
        let removed = self.manager.remove_cluster(name)?;
        self.ops.lock().unwrap().push(RegistryOp::Remove {
            name: name.to_string(),
            removed,
        });
        Ok(removed)
    }
}

// --- Discovery bodies ---

pub fn cluster_json(name: &str, connect_timeout_ms: u64) -> String {
    format!(
        r#"{{"name": "{name}", "type": "strict_dns", "connect_timeout_ms": {connect_timeout_ms}, "lb_type": "round_robin", "hosts": [{{"url": "tcp://{name}.internal:80"}}]}}"#
    )
}

/// Discovery response listing `names`, all with a 250ms connect timeout.
pub fn cds_body(names: &[&str]) -> String {
    let clusters: Vec<String> = names.iter().map(|n| cluster_json(n, 250)).collect();
    format!(r#"{{"clusters": [{}]}}"#, clusters.join(","))
}

pub fn cluster_definition(name: &str, connect_timeout_ms: u64) -> ClusterDefinition {
    let json = serde_json::from_str(&cluster_json(name, connect_timeout_ms)).unwrap();
    ClusterDefinition::from_json(json).unwrap()
}

// --- TestHttpServer ---

/// Minimal HTTP/1.1 server answering every request with a canned response.
pub struct TestHttpServer {
    pub addr: SocketAddr,
    response: Arc<Mutex<(u16, String)>>,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown: CancellationToken,
}

impl TestHttpServer {
    pub async fn start(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test server");
        let addr = listener.local_addr().expect("failed to get local addr");
        let response = Arc::new(Mutex::new((status, body.to_string())));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let task_response = response.clone();
        let task_requests = requests.clone();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = tokio::select! {
                    _ = task_shutdown.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(_) => return,
                    },
                };

                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request_line = String::from_utf8_lossy(&buf)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                task_requests.lock().unwrap().push(request_line);

                let (status, body) = task_response.lock().unwrap().clone();
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Self {
            addr,
            response,
            requests,
            shutdown,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_response(&self, status: u16, body: &str) {
        *self.response.lock().unwrap() = (status, body.to_string());
    }

    /// Request lines received so far (e.g. `GET /v1/clusters/a/b HTTP/1.1`).
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
