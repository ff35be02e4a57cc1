//! Error types for cloudlet-dns.

use thiserror::Error;

/// Errors surfaced by the registry, the trackers and the resolver.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed registration input; never enters the registry.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown service or cloudlet.
    #[error("{0} not found")]
    NotFound(String),

    /// Upstream DNS server gave no usable response.
    #[error("upstream DNS unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream answered without a record of the requested type.
    #[error("no data for {0}")]
    NoData(String),

    /// Telemetry stream of a cloudlet broke.
    #[error("workload tracker failed: {0}")]
    Tracker(String),

    /// Cache store could not be reached or returned garbage.
    #[error("cache store error: {0}")]
    CacheStore(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO error (socket bind, file read)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_server::proto::error::ProtoError),
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::CacheStore(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Tracker(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
