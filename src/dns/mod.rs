//! Shared hostname resolution cache.
//!
//! Backends are usually configured by hostname; resolving on every dial
//! would put the resolver on the hot path. Entries carry the time they
//! were resolved and are refreshed lazily once they outlive the TTL.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::lookup_host;
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedAddr {
    addr: IpAddr,
    resolved_at: Instant,
}

pub struct DnsCache {
    entries: DashMap<String, CachedAddr>,
    ttl: Duration,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Resolve a hostname, consulting the cache first.
    ///
    /// Literal addresses bypass the cache entirely.
    pub async fn resolve(&self, host: &str, port: u16) -> std::io::Result<IpAddr> {
        if let Ok(addr) = host.parse::<IpAddr>() {
            return Ok(addr);
        }

        if let Some(entry) = self.entries.get(host) {
            if entry.resolved_at.elapsed() < self.ttl {
                return Ok(entry.addr);
            }
        }

        let mut addrs = lookup_host((host, port)).await?;
        let addr = addrs
            .next()
            .map(|sa| sa.ip())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for host {}", host),
                )
            })?;

        debug!(host = %host, addr = %addr, "hostname resolved");
        self.entries.insert(
            host.to_string(),
            CachedAddr {
                addr,
                resolved_at: Instant::now(),
            },
        );
        Ok(addr)
    }

    /// Drop entries older than the TTL
    pub fn evict_stale(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.resolved_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_address_bypasses_cache() {
        let cache = DnsCache::new(Duration::from_secs(60));
        let addr = cache.resolve("10.0.0.9", 3306).await.unwrap();
        assert_eq!(addr, "10.0.0.9".parse::<IpAddr>().unwrap());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_localhost_resolution_is_cached() {
        let cache = DnsCache::new(Duration::from_secs(60));
        let first = cache.resolve("localhost", 3306).await.unwrap();
        assert_eq!(cache.len(), 1);
        let second = cache.resolve("localhost", 3306).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_evict_stale() {
        let cache = DnsCache::new(Duration::from_millis(0));
        cache.resolve("localhost", 3306).await.unwrap();
        cache.evict_stale();
        assert!(cache.is_empty());
    }
}
