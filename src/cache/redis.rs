//! Redis-backed cache store.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{cmd, Client};
use async_trait::async_trait;
use log::warn;

use super::{CacheStore, KeyTtl};
use crate::error::Result;

/// Cache store in a Redis database.
///
/// A single multiplexed connection is shared by every resolver call;
/// cloning it is cheap and each command borrows its own handle.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect and ping.  A store that does not answer the ping is an error,
    /// not a degraded cache.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;
        cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(Self { conn })
    }
}

/// Decode the reply of `TTL key`: -2 for a missing key, -1 for a key
/// without expiry, otherwise remaining seconds.
pub(crate) fn ttl_from_reply(reply: i64) -> KeyTtl {
    match reply {
        -2 => KeyTtl::Missing,
        n if n < 0 => KeyTtl::Persistent,
        n => KeyTtl::Expires(Duration::from_secs(n as u64)),
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        if ttl_secs > 0 {
            cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let mut conn = self.conn.clone();
        let reply: i64 = cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl_from_reply(reply))
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        cmd("FLUSHDB").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) {
        // The multiplexed driver task ends once the last handle drops;
        // a QUIT makes the server side let go right away.
        let mut conn = self.conn.clone();
        if let Err(e) = cmd("QUIT").query_async::<_, ()>(&mut conn).await {
            warn!("Cache store QUIT failed: {}", e);
        }
    }
}
