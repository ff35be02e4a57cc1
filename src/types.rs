//! Data structures shared by the registry, the workload trackers and the
//! DNS handler.
//!
//! `Service` and `WorkloadStatusMessage` are serialised with
//! [`serde`](https://serde.rs/): services come from configuration and
//! workload messages arrive as JSON on each cloudlet's telemetry stream.

use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use hickory_server::proto::rr::RecordType;
use serde::{Deserialize, Serialize};

/// A named capability reachable under a DNS-queryable domain.
///
/// A service says nothing about which cloudlets provide it; providers
/// associate themselves through the registry.  Two services are the same
/// service when their domains are equal, since the domain is the key the
/// DNS handler looks them up by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Display name, e.g. `video`.
    pub name: String,
    /// Domain clients query, without the trailing root label.
    pub domain: String,
}

impl Service {
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
        }
    }

    /// Derive a service from a bare domain.  The first label becomes the
    /// service name (`video.edge.example` → `video`).
    pub fn from_domain(domain: &str) -> Self {
        let domain = domain.trim().trim_end_matches('.');
        let name = domain.split('.').next().unwrap_or(domain);
        Self::new(name, domain)
    }
}

impl PartialEq for Service {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain
    }
}

impl Eq for Service {}

impl Hash for Service {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.domain.hash(state);
    }
}

/// One frame of a cloudlet's telemetry stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatusMessage {
    #[serde(rename = "ClientCount")]
    pub client_count: i32,
}

/// Address family of a question the director can answer.
///
/// Only A and AAAA questions are load balanced or cached; each family has
/// its own cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn from_record_type(record_type: RecordType) -> Option<Self> {
        match record_type {
            RecordType::A => Some(Self::V4),
            RecordType::AAAA => Some(Self::V6),
            _ => None,
        }
    }

    pub fn of(address: IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn record_type(self) -> RecordType {
        match self {
            Self::V4 => RecordType::A,
            Self::V6 => RecordType::AAAA,
        }
    }

    /// Prefix of this family's keys in the cache store.
    pub fn cache_prefix(self) -> &'static str {
        match self {
            Self::V4 => "ipv4:",
            Self::V6 => "ipv6:",
        }
    }

    /// Full cache key for `domain` in this family.
    pub fn cache_key(self, domain: &str) -> String {
        format!("{}{}", self.cache_prefix(), domain)
    }
}
