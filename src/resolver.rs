//! Cache-aside fallback resolution.
//!
//! Names that are not routed to a cloudlet are answered here: first from
//! the address cache, then from the configured upstream server.  One
//! upstream exchange yields both outputs, the full answer set for the client
//! and the first address of the requested family for the cache.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use hickory_server::proto::rr::rdata::{A, AAAA};
use hickory_server::proto::rr::{Name, RData, Record, RecordType};
use log::{debug, warn};

use crate::cache::{CacheStore, KeyTtl};
use crate::error::{Error, Result};
use crate::types::AddressFamily;

/// Recursive DNS server the resolver falls back to.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Answer section for `name`/`record_type`.
    ///
    /// Fails with [`Error::UpstreamUnavailable`] when no response arrives
    /// and [`Error::NoData`] for a non-success response code or an empty
    /// answer.
    async fn query(&self, name: &Name, record_type: RecordType) -> Result<Vec<Record>>;
}

/// Upstream reached through hickory's resolver, pinned to one server.
pub struct HickoryUpstream {
    resolver: TokioAsyncResolver,
}

impl HickoryUpstream {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        let servers = NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], servers);
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        // Caching is the cache store's job.
        opts.cache_size = 0;
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait]
impl Upstream for HickoryUpstream {
    async fn query(&self, name: &Name, record_type: RecordType) -> Result<Vec<Record>> {
        match self.resolver.lookup(name.clone(), record_type).await {
            Ok(lookup) => Ok(lookup.records().to_vec()),
            Err(e) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { response_code, .. } => Err(Error::NoData(
                    format!("{} {} ({})", name, record_type, response_code),
                )),
                _ => Err(Error::UpstreamUnavailable(e.to_string())),
            },
        }
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub address: IpAddr,
    pub from_cache: bool,
    /// Records to put in the client's answer section: the upstream answer
    /// set on a miss, a single synthesized record on a hit.
    pub records: Vec<Record>,
}

/// Cache-aside resolver over an injected store and upstream.
pub struct CacheAsideResolver {
    store: Arc<dyn CacheStore>,
    upstream: Arc<dyn Upstream>,
    ttl_secs: i64,
}

fn fqdn(name: &str) -> Result<Name> {
    let mut fqdn = Name::from_ascii(name)
        .map_err(|e| Error::InvalidArgument(format!("bad domain name {:?}: {}", name, e)))?;
    fqdn.set_fqdn(true);
    Ok(fqdn)
}

fn address_of(record: &Record, family: AddressFamily) -> Option<IpAddr> {
    match (record.data(), family) {
        (Some(RData::A(a)), AddressFamily::V4) => Some(IpAddr::V4(a.0)),
        (Some(RData::AAAA(aaaa)), AddressFamily::V6) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    }
}

/// Address record for `name`, or `None` if `address` is of the other family.
pub fn address_record(name: Name, ttl: u32, address: IpAddr, family: AddressFamily) -> Option<Record> {
    let rdata = match (address, family) {
        (IpAddr::V4(v4), AddressFamily::V4) => RData::A(A(v4)),
        (IpAddr::V6(v6), AddressFamily::V6) => RData::AAAA(AAAA(v6)),
        _ => return None,
    };
    Some(Record::from_rdata(name, ttl, rdata))
}

impl CacheAsideResolver {
    /// `ttl_secs` applies to every cache write; zero or less means entries
    /// never expire.
    pub fn new(store: Arc<dyn CacheStore>, upstream: Arc<dyn Upstream>, ttl_secs: i64) -> Self {
        Self {
            store,
            upstream,
            ttl_secs,
        }
    }

    fn answer_ttl(&self) -> u32 {
        self.ttl_secs.clamp(0, u32::MAX as i64) as u32
    }

    /// TTL put on an answer served from `key`: whatever the entry has left,
    /// so clients never hold it longer than the cache does.
    async fn hit_ttl(&self, key: &str) -> u32 {
        match self.store.ttl(key).await {
            Ok(KeyTtl::Expires(left)) => left.as_secs().min(u64::from(u32::MAX)) as u32,
            Ok(KeyTtl::Persistent) => self.answer_ttl(),
            Ok(KeyTtl::Missing) => 0,
            Err(e) => {
                debug!("Cannot read TTL of {}: {}", key, e);
                self.answer_ttl()
            }
        }
    }

    /// Resolve `name` (no trailing dot) in `family`.
    pub async fn resolve(&self, name: &str, family: AddressFamily) -> Result<Resolution> {
        let key = family.cache_key(name);
        let owner = fqdn(name)?;

        if let Some(address) = self.cached(&key).await {
            debug!("Cache hit for {}: {}", key, address);
            let records = address_record(owner, self.hit_ttl(&key).await, address, family)
                .into_iter()
                .collect();
            return Ok(Resolution {
                address,
                from_cache: true,
                records,
            });
        }

        let records = self.upstream.query(&owner, family.record_type()).await?;
        let address = records
            .iter()
            .find_map(|record| address_of(record, family))
            .ok_or_else(|| Error::NoData(format!("{} {}", name, family.record_type())))?;

        if let Err(e) = self.store.set(&key, &address.to_string(), self.ttl_secs).await {
            warn!("Failed to cache {} -> {}: {}", key, address, e);
        }

        Ok(Resolution {
            address,
            from_cache: false,
            records,
        })
    }

    /// Cached address under `key`.  Store failures and unparsable values
    /// count as misses.
    async fn cached(&self, key: &str) -> Option<IpAddr> {
        match self.store.get(key).await {
            Ok(Some(value)) => match value.parse() {
                Ok(address) => Some(address),
                Err(_) => {
                    warn!("Ignoring unparsable cache entry {} = {:?}", key, value);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cache lookup for {} failed, asking upstream: {}", key, e);
                None
            }
        }
    }

    /// Drop the cached address of `name`.
    pub async fn forget(&self, name: &str, family: AddressFamily) -> Result<()> {
        self.store.delete(&family.cache_key(name)).await
    }

    pub async fn remaining_ttl(&self, name: &str, family: AddressFamily) -> Result<KeyTtl> {
        self.store.ttl(&family.cache_key(name)).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    /// Close the cache store connection.
    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Upstream fakes for unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Upstream answering from a fixed table and counting queries.
    #[derive(Default)]
    pub struct StaticUpstream {
        answers: Mutex<Vec<(String, IpAddr)>>,
        calls: AtomicUsize,
    }

    impl StaticUpstream {
        pub fn with(name: &str, address: &str) -> Self {
            let upstream = Self::default();
            upstream
                .answers
                .lock()
                .push((name.to_string(), address.parse().unwrap()));
            upstream
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for StaticUpstream {
        async fn query(&self, name: &Name, record_type: RecordType) -> Result<Vec<Record>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let wanted = name.to_ascii();
            let family = AddressFamily::from_record_type(record_type)
                .ok_or_else(|| Error::NoData(wanted.clone()))?;
            let records: Vec<Record> = self
                .answers
                .lock()
                .iter()
                .filter(|(n, _)| format!("{}.", n) == wanted)
                .filter_map(|(_, ip)| address_record(name.clone(), 300, *ip, family))
                .collect();
            if records.is_empty() {
                return Err(Error::NoData(wanted));
            }
            Ok(records)
        }
    }

    /// Upstream that never answers.
    pub struct DeadUpstream;

    #[async_trait]
    impl Upstream for DeadUpstream {
        async fn query(&self, name: &Name, _record_type: RecordType) -> Result<Vec<Record>> {
            Err(Error::UpstreamUnavailable(format!("timed out resolving {}", name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{DeadUpstream, StaticUpstream};
    use super::*;
    use crate::cache::MemoryStore;

    /// Store that is always down.
    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::CacheStore("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl_secs: i64) -> Result<()> {
            Err(Error::CacheStore("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Err(Error::CacheStore("connection refused".into()))
        }
        async fn ttl(&self, _key: &str) -> Result<KeyTtl> {
            Err(Error::CacheStore("connection refused".into()))
        }
        async fn flush(&self) -> Result<()> {
            Err(Error::CacheStore("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn miss_goes_upstream_and_populates_cache() {
        let store = Arc::new(MemoryStore::new());
        let upstream = Arc::new(StaticUpstream::with("svc.example", "93.184.216.34"));
        let resolver = CacheAsideResolver::new(store.clone(), upstream.clone(), 60);

        let first = resolver.resolve("svc.example", AddressFamily::V4).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.address, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(first.records.len(), 1);
        assert_eq!(
            store.get("ipv4:svc.example").await.unwrap().as_deref(),
            Some("93.184.216.34")
        );

        let second = resolver.resolve("svc.example", AddressFamily::V4).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn warm_cache_skips_upstream() {
        let store = Arc::new(MemoryStore::new());
        store.set("ipv6:unknown.example", "fd00::7", 0).await.unwrap();
        let upstream = Arc::new(StaticUpstream::default());
        let resolver = CacheAsideResolver::new(store, upstream.clone(), 60);

        let hit = resolver.resolve("unknown.example", AddressFamily::V6).await.unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.address, "fd00::7".parse::<IpAddr>().unwrap());
        assert_eq!(hit.records[0].record_type(), RecordType::AAAA);
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn families_do_not_share_entries() {
        let store = Arc::new(MemoryStore::new());
        store.set("ipv4:svc.example", "10.0.0.1", 0).await.unwrap();
        let resolver = CacheAsideResolver::new(store, Arc::new(StaticUpstream::default()), 60);

        assert!(matches!(
            resolver.resolve("svc.example", AddressFamily::V6).await,
            Err(Error::NoData(_))
        ));
    }

    #[tokio::test]
    async fn upstream_failure_and_no_data_leave_cache_untouched() {
        let store = Arc::new(MemoryStore::new());
        let dead = CacheAsideResolver::new(store.clone(), Arc::new(DeadUpstream), 60);
        assert!(matches!(
            dead.resolve("svc.example", AddressFamily::V4).await,
            Err(Error::UpstreamUnavailable(_))
        ));

        let empty = CacheAsideResolver::new(store.clone(), Arc::new(StaticUpstream::default()), 60);
        assert!(matches!(
            empty.resolve("svc.example", AddressFamily::V4).await,
            Err(Error::NoData(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn broken_store_is_a_forced_miss() {
        let upstream = Arc::new(StaticUpstream::with("svc.example", "10.1.1.1"));
        let resolver = CacheAsideResolver::new(Arc::new(BrokenStore), upstream.clone(), 60);

        let resolution = resolver.resolve("svc.example", AddressFamily::V4).await.unwrap();
        assert!(!resolution.from_cache);
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_carries_remaining_ttl() {
        let store = Arc::new(MemoryStore::new());
        let upstream = Arc::new(StaticUpstream::with("svc.example", "10.1.1.1"));
        let resolver = CacheAsideResolver::new(store, upstream, 30);

        resolver.resolve("svc.example", AddressFamily::V4).await.unwrap();
        tokio::time::advance(Duration::from_secs(12)).await;

        let hit = resolver.resolve("svc.example", AddressFamily::V4).await.unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.records[0].ttl(), 18);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_answer_expires_with_ttl() {
        let store = Arc::new(MemoryStore::new());
        let upstream = Arc::new(StaticUpstream::with("svc.example", "10.1.1.1"));
        let resolver = CacheAsideResolver::new(store, upstream.clone(), 30);

        resolver.resolve("svc.example", AddressFamily::V4).await.unwrap();
        assert!(matches!(
            resolver.remaining_ttl("svc.example", AddressFamily::V4).await.unwrap(),
            KeyTtl::Expires(_)
        ));

        tokio::time::advance(Duration::from_secs(31)).await;
        let again = resolver.resolve("svc.example", AddressFamily::V4).await.unwrap();
        assert!(!again.from_cache);
        assert_eq!(upstream.calls(), 2);

        resolver.forget("svc.example", AddressFamily::V4).await.unwrap();
        assert_eq!(
            resolver.remaining_ttl("svc.example", AddressFamily::V4).await.unwrap(),
            KeyTtl::Missing
        );
    }
}
