//! Cloudlet DNS - a DNS-level traffic director for edge cloudlets.
//!
//! Names of registered services are answered with the address of the least
//! loaded cloudlet currently providing the service, based on the client
//! counts each cloudlet streams to us.  Every other name, and every service
//! whose cloudlets are all above the workload threshold, is resolved
//! recursively through a TTL-bounded address cache.
//!
//! ```text
//!              DNS query (UDP)
//!                     │
//!                     ▼
//!        ┌─────────────────────┐  service?  ┌──────────────┐
//!        │    LoadBalancer     │───────────▶│   Registry   │
//!        │  (per datagram)     │            │  services +  │
//!        └──────────┬──────────┘            │  cloudlets   │
//!                   │ fallback              └──────┬───────┘
//!                   ▼                              │ workload
//!        ┌─────────────────────┐            ┌──────┴───────┐
//!        │ CacheAsideResolver  │            │   trackers   │◀── HTTP stream
//!        │ cache ─▶ upstream   │            │  (one/node)  │    per cloudlet
//!        └─────────────────────┘            └──────────────┘
//! ```

pub mod cache;
pub mod cloudlet;
pub mod config;
pub mod dns_server;
pub mod error;
pub mod registry;
pub mod resolver;
pub mod types;

pub use cloudlet::{CloudletNode, HttpTelemetry, TelemetrySource};
pub use config::Config;
pub use dns_server::{run_dns_server, serve, LoadBalancer};
pub use error::Error;
pub use registry::Registry;
pub use resolver::{CacheAsideResolver, HickoryUpstream, Upstream};
pub use types::{AddressFamily, Service, WorkloadStatusMessage};
