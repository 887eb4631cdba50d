//! DNS resolution with a bounded TTL cache
//!
//! Cache hits return without suspending. A miss fans out one query per
//! configured server in parallel and the first well-formed answer wins;
//! the whole race shares a single fixed timeout. Cached records live
//! for a fixed lifetime regardless of the TTL the server reported.

mod wire;

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Fixed lifetime of a cached record
const RECORD_TTL: Duration = Duration::from_secs(300);

/// Overall budget for one resolution race
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the number of cached names
const CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(512) {
    Some(n) => n,
    None => panic!("cache capacity must be non-zero"),
};

/// Receive buffer for UDP answers
const MAX_RESPONSE_LEN: usize = 512;

/// A resolved address with its expiry accounting
#[derive(Debug, Clone)]
pub struct DnsRecord {
    /// The resolved address
    pub address: IpAddr,
    resolved_at: Instant,
    ttl: Duration,
}

impl DnsRecord {
    fn new(address: IpAddr, ttl: Duration) -> Self {
        Self {
            address,
            resolved_at: Instant::now(),
            ttl,
        }
    }

    /// Whether the record has outlived its TTL
    pub fn is_expired(&self) -> bool {
        self.resolved_at.elapsed() > self.ttl
    }
}

/// Parallel-fan-out resolver with an LRU record cache
pub struct Resolver {
    servers: RwLock<Vec<SocketAddr>>,
    cache: Mutex<LruCache<String, DnsRecord>>,
    ttl: Duration,
    timeout: Duration,
}

impl Resolver {
    pub fn new(servers: Vec<SocketAddr>) -> Self {
        Self {
            servers: RwLock::new(servers),
            cache: Mutex::new(LruCache::new(CACHE_CAPACITY)),
            ttl: RECORD_TTL,
            timeout: QUERY_TIMEOUT,
        }
    }

    /// Override the record lifetime
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Override the resolution timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the upstream server set
    pub fn set_servers(&self, servers: Vec<SocketAddr>) {
        *self.servers.write() = servers;
    }

    /// Current upstream server set
    pub fn servers(&self) -> Vec<SocketAddr> {
        self.servers.read().clone()
    }

    /// Resolve a hostname, consulting the cache first
    ///
    /// An expired cache entry is dropped and re-resolved; the address of
    /// an expired record is never returned.
    pub async fn resolve(&self, hostname: &str) -> Result<IpAddr> {
        if let Some(address) = self.cache_lookup(hostname) {
            return Ok(address);
        }

        let address = self.resolve_uncached(hostname).await?;
        self.cache
            .lock()
            .put(hostname.to_string(), DnsRecord::new(address, self.ttl));
        Ok(address)
    }

    /// Peek at the cached record for a hostname, if any
    ///
    /// Does not touch recency order and returns expired records as-is;
    /// callers can check `is_expired` themselves.
    pub fn cached(&self, hostname: &str) -> Option<DnsRecord> {
        self.cache.lock().peek(hostname).cloned()
    }

    /// Drop all cached records
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
        debug!("dns cache cleared");
    }

    /// Number of cached records, expired ones included
    pub fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }

    fn cache_lookup(&self, hostname: &str) -> Option<IpAddr> {
        let mut cache = self.cache.lock();
        match cache.get(hostname) {
            Some(record) if !record.is_expired() => {
                trace!("dns cache hit for {}", hostname);
                Some(record.address)
            }
            Some(_) => {
                // Lazy eviction on first touch past the TTL.
                cache.pop(hostname);
                None
            }
            None => None,
        }
    }

    async fn resolve_uncached(&self, hostname: &str) -> Result<IpAddr> {
        let servers = self.servers();
        if servers.is_empty() {
            return Err(Error::Dns("no servers configured".into()));
        }

        let (tx, mut rx) = mpsc::channel(servers.len());
        for server in servers {
            let tx = tx.clone();
            let name = hostname.to_string();
            let budget = self.timeout;
            tokio::spawn(async move {
                // Bound each query so the task cannot outlive the race.
                let result = match tokio::time::timeout(budget, query_server(server, &name)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout),
                };
                let _ = tx.send((server, result)).await;
            });
        }
        drop(tx);

        let race = tokio::time::timeout(self.timeout, async {
            let mut last_err = None;
            while let Some((server, result)) = rx.recv().await {
                match result {
                    Ok(address) => {
                        debug!("resolved {} to {} via {}", hostname, address, server);
                        return Ok(address);
                    }
                    Err(e) => {
                        trace!("dns query to {} for {} failed: {}", server, hostname, e);
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err
                .unwrap_or_else(|| Error::Dns(format!("all servers failed for {}", hostname))))
        })
        .await;

        match race {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }
}

/// Send one A query to a single server and await its answer
async fn query_server(server: SocketAddr, hostname: &str) -> Result<IpAddr> {
    let bind_addr: SocketAddr = if server.is_ipv6() {
        "[::]:0".parse().map_err(|_| Error::Dns("bind".into()))?
    } else {
        "0.0.0.0:0".parse().map_err(|_| Error::Dns("bind".into()))?
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(server).await?;

    let id = rand::random::<u16>();
    let query = wire::encode_query(id, hostname)?;
    socket.send(&query).await?;

    let mut buf = [0u8; MAX_RESPONSE_LEN];
    let len = socket.recv(&mut buf).await?;
    let address = wire::decode_response(&buf[..len], id)?;
    Ok(IpAddr::V4(address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Build a well-formed response to `query` with a single A answer
    fn build_response(query: &[u8], answer: [u8; 4]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&query[..2]); // echo id
        buf.extend_from_slice(&0x8180u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        buf.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&query[12..]); // echo question
        buf.extend_from_slice(&[0xC0, 0x0C]);
        buf.extend_from_slice(&1u16.to_be_bytes()); // TYPE A
        buf.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
        buf.extend_from_slice(&3600u32.to_be_bytes()); // upstream TTL, ignored
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&answer);
        buf
    }

    /// Spawn a DNS server answering every query with `answer`
    async fn spawn_dns_server(answer: [u8; 4]) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let response = build_response(&buf[..len], answer);
                let _ = socket.send_to(&response, peer).await;
            }
        });

        (addr, queries)
    }

    /// Spawn a DNS server that reads queries but never answers
    async fn spawn_silent_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                if socket.recv_from(&mut buf).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_expiry_boundary() {
        let record = DnsRecord::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), RECORD_TTL);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!record.is_expired());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(record.is_expired());
    }

    #[tokio::test]
    async fn test_resolve_and_cache() {
        let (server, queries) = spawn_dns_server([93, 184, 216, 34]).await;
        let resolver = Resolver::new(vec![server]);

        let first = resolver.resolve("example.com").await.unwrap();
        assert_eq!(first, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));

        let second = resolver.resolve("example.com").await.unwrap();
        assert_eq!(second, first);

        // Second lookup was served from the cache.
        assert_eq!(queries.load(Ordering::SeqCst), 1);
        assert!(resolver.cached("example.com").is_some());
        assert!(resolver.cached("other.test").is_none());
    }

    #[tokio::test]
    async fn test_first_answer_wins_with_slow_server() {
        let silent = spawn_silent_server().await;
        let (good, _) = spawn_dns_server([10, 20, 30, 40]).await;
        let resolver = Resolver::new(vec![silent, good]);

        let address = resolver.resolve("fanout.test").await.unwrap();
        assert_eq!(address, IpAddr::V4(Ipv4Addr::new(10, 20, 30, 40)));
    }

    #[tokio::test]
    async fn test_all_servers_silent_times_out() {
        let silent = spawn_silent_server().await;
        let resolver =
            Resolver::new(vec![silent]).with_timeout(Duration::from_millis(200));

        let err = resolver.resolve("dead.test").await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(resolver.cached("dead.test").is_none());
    }

    #[tokio::test]
    async fn test_no_servers_fails() {
        let resolver = Resolver::new(vec![]);
        assert!(resolver.resolve("nowhere.test").await.is_err());
    }

    #[tokio::test]
    async fn test_expired_record_is_requeried() {
        let (server, queries) = spawn_dns_server([1, 1, 1, 1]).await;
        let resolver = Resolver::new(vec![server]).with_ttl(Duration::from_millis(40));

        resolver.resolve("short.test").await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        resolver.resolve("short.test").await.unwrap();

        assert_eq!(queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_cache_forces_requery() {
        let (server, queries) = spawn_dns_server([2, 2, 2, 2]).await;
        let resolver = Resolver::new(vec![server]);

        resolver.resolve("cleared.test").await.unwrap();
        assert_eq!(resolver.cache_len(), 1);

        resolver.clear_cache();
        assert_eq!(resolver.cache_len(), 0);

        resolver.resolve("cleared.test").await.unwrap();
        assert_eq!(queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_set_servers_replaces_upstreams() {
        let (first, first_queries) = spawn_dns_server([3, 3, 3, 3]).await;
        let (second, second_queries) = spawn_dns_server([4, 4, 4, 4]).await;
        let resolver = Resolver::new(vec![first]);

        resolver.resolve("one.test").await.unwrap();
        resolver.set_servers(vec![second]);
        let address = resolver.resolve("two.test").await.unwrap();

        assert_eq!(address, IpAddr::V4(Ipv4Addr::new(4, 4, 4, 4)));
        assert_eq!(first_queries.load(Ordering::SeqCst), 1);
        assert_eq!(second_queries.load(Ordering::SeqCst), 1);
    }
}
