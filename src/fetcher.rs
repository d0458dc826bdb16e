//! Periodic HTTP fetch of the cluster discovery API.

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cds::{CdsApi, CdsStats, FetchFailure};
use crate::config::CdsConfig;
use crate::error::DiscoveryError;
use crate::metrics::{self, Timer};

/// Polls the discovery server and feeds responses to a [`CdsApi`].
pub struct RestApiFetcher {
    client: reqwest::Client,
    url: String,
    refresh_delay: Duration,
    cds: CdsApi,
}

impl RestApiFetcher {
    /// Create a fetcher for `cds` against the server in `config`.
    pub fn new(config: &CdsConfig, cds: CdsApi) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let url = format!(
            "{}{}",
            config.server.trim_end_matches('/'),
            cds.request_path()
        );

        Ok(Self {
            client,
            url,
            refresh_delay: config.refresh_delay(),
            cds,
        })
    }

    /// Full request URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Counters of the underlying reconciler.
    pub fn stats(&self) -> CdsStats {
        self.cds.stats()
    }

    /// Fetch immediately, then every refresh delay, until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            url = %self.url,
            refresh_delay_ms = self.refresh_delay.as_millis() as u64,
            "Starting cluster discovery"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Cluster discovery shutting down");
                    return;
                }

                _ = self.fetch_once() => {}
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Cluster discovery shutting down");
                    return;
                }

                _ = sleep(self.refresh_delay) => {}
            }
        }
    }

    /// Run one fetch and hand the outcome to the reconciler.
    pub async fn fetch_once(&mut self) {
        let timer = Timer::start();
        debug!(url = %self.url, "cds: starting request");

        let result = self.fetch_body().await;
        metrics::record_fetch_duration(timer.elapsed());

        match result {
            Ok(body) => {
                // Counted and logged by the reconciler; the next fetch retries.
                let _ = self.cds.on_fetch_succeeded(&body);
            }
            Err(failure) => self.cds.on_fetch_failed(failure),
        }
    }

    async fn fetch_body(&self) -> Result<String, FetchFailure> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            debug!(url = %self.url, error = %e, "cds: request failed");
            FetchFailure::Network
        })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchFailure::Exception(DiscoveryError::UnexpectedStatus(
                status.as_u16(),
            )));
        }

        response
            .text()
            .await
            .map_err(|e| FetchFailure::Exception(e.into()))
    }
}
