//! Address cache used by the cache-aside resolver.
//!
//! The store is a plain key/value table with per-key expiry.  Keys are
//! namespaced by address family (`ipv4:` / `ipv6:`, see
//! [`AddressFamily::cache_key`](crate::types::AddressFamily::cache_key)) and
//! values are address strings.  The store is never a system of record:
//! losing it only costs upstream round trips.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::info;

use crate::error::{Error, Result};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Remaining lifetime of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist (or already expired).
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after this long.
    Expires(Duration),
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Value stored under `key`, `None` on a miss.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.  A positive
    /// `ttl_secs` expires the key that many seconds from now; zero or a
    /// negative value leaves it without expiry.
    async fn set(&self, key: &str, value: &str, ttl_secs: i64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// Drop every key.
    async fn flush(&self) -> Result<()>;

    /// Release the connection.  Further calls may fail.
    async fn close(&self) {}
}

/// Open the store named by the `cache_store` setting: `memory` for an
/// in-process table or a `redis://` URL.  Fails when the store cannot be
/// reached, which is fatal at startup.
pub async fn open(target: &str) -> Result<Arc<dyn CacheStore>> {
    if target.eq_ignore_ascii_case("memory") {
        info!("Using in-process address cache");
        return Ok(Arc::new(MemoryStore::new()));
    }
    if target.starts_with("redis://") || target.starts_with("rediss://") {
        let store = RedisStore::connect(target).await?;
        info!("Connected to cache store at {}", target);
        return Ok(Arc::new(store));
    }
    Err(Error::Config(format!("unsupported cache store {}", target)))
}
