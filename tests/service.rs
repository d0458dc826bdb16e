//! Service lifecycle with a scripted resolver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tokio_util::sync::CancellationToken;
use upstream_discovery::config::{Config, DnsLookupFamily, HostConfig};
use upstream_discovery::{DiscoveryError, UpstreamService};

fn config_with_logical_dns() -> Config {
    Config {
        logical_dns_clusters: vec![logical_dns_config(DnsLookupFamily::V4Only)],
        static_clusters: vec![serde_json::from_str(&cluster_json("local", 100)).unwrap()],
        ..Config::default()
    }
}

#[tokio::test]
async fn test_service_registers_clusters_and_stops() {
    let resolver = MockResolver::new();
    resolver.respond_inline(&["127.0.0.1"]);
    let service =
        UpstreamService::with_resolver(config_with_logical_dns(), Arc::new(resolver.clone()));
    let registry = service.registry().clone();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(service.run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "clusters not registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.names(), vec!["local", "name"]);
    assert_eq!(registry.get("name").unwrap().config()["type"], "logical_dns");
    assert_eq!(resolver.calls(), 1);

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("service did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_service_shutdown_cancels_pending_resolution() {
    let resolver = MockResolver::new();
    let service =
        UpstreamService::with_resolver(config_with_logical_dns(), Arc::new(resolver.clone()));
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(service.run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !resolver.has_pending() {
        assert!(tokio::time::Instant::now() < deadline, "no resolution issued");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("service did not stop")
        .unwrap()
        .unwrap();
    assert!(resolver.last_query_cancelled());
}

#[tokio::test]
async fn test_service_rejects_invalid_logical_dns_config() {
    let resolver = MockResolver::new();
    let mut config = config_with_logical_dns();
    config.logical_dns_clusters[0].hosts.push(HostConfig {
        url: "tcp://other.bar.com:443".to_string(),
    });
    let service = UpstreamService::with_resolver(config, Arc::new(resolver.clone()));
    let registry = service.registry().clone();

    let result = service.run(CancellationToken::new()).await;

    assert!(matches!(result, Err(DiscoveryError::Configuration(_))));
    assert_eq!(resolver.calls(), 0);
    assert!(!registry.contains("name"));
    assert_eq!(registry.names(), vec!["local"]);
}

#[tokio::test]
async fn test_service_shuts_down_cluster_it_cannot_register() {
    let resolver = MockResolver::new();
    let mut config = config_with_logical_dns();
    config.static_clusters = vec![serde_json::from_str(&cluster_json("name", 100)).unwrap()];
    let service = UpstreamService::with_resolver(config, Arc::new(resolver.clone()));
    let registry = service.registry().clone();

    let result = service.run(CancellationToken::new()).await;

    assert!(matches!(result, Err(DiscoveryError::Configuration(_))));
    assert_eq!(resolver.calls(), 1);
    assert!(resolver.last_query_cancelled());
    assert_eq!(registry.get("name").unwrap().config()["type"], "strict_dns");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_service_runs_discovery_alongside_logical_dns() {
    let server = TestHttpServer::start(200, &cds_body(&["a", "b"])).await;
    let resolver = MockResolver::new();
    resolver.respond_inline(&["127.0.0.1"]);
    let config = Config {
        cds: Some(cds_config(&server.url())),
        ..config_with_logical_dns()
    };
    let service = UpstreamService::with_resolver(config, Arc::new(resolver.clone()));
    let registry = service.registry().clone();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(service.run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.len() < 4 {
        assert!(tokio::time::Instant::now() < deadline, "discovery not applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.names(), vec!["a", "b", "local", "name"]);

    // Discovery never removes locally defined clusters.
    server.set_response(200, &cds_body(&["b"]));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.contains("a") {
        assert!(tokio::time::Instant::now() < deadline, "update not applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.names(), vec!["b", "local", "name"]);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("service did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_service_rejects_cds_without_local_info() {
    let mut config = Config::default();
    let mut cds = cds_config("http://127.0.0.1:1");
    cds.service_cluster.clear();
    config.cds = Some(cds);
    let service = UpstreamService::with_resolver(config, Arc::new(MockResolver::new()));

    let result = service.run(CancellationToken::new()).await;

    assert!(matches!(result, Err(DiscoveryError::Configuration(_))));
}
