//! Error types for upstream-discovery.

use thiserror::Error;

/// Errors that can occur while reconciling clusters or resolving hosts.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Discovery response body was not valid JSON or failed schema checks.
    #[error("Malformed discovery response: {0}")]
    MalformedResponse(String),

    /// Fetch or resolution failed without a structured cause.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Invalid static configuration. Fatal at construction.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Cluster registry rejected a mutation.
    #[error("Cluster registry error: {0}")]
    Registry(String),

    /// Discovery server answered with a non-200 status.
    #[error("Unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// DNS resolver error
    #[error("DNS resolution error: {0}")]
    Resolve(#[from] hickory_resolver::ResolveError),
}
