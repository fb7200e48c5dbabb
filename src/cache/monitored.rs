//! Domain-failover watchdog.
//!
//! When a configuration names its instance through a DNS domain, the domain
//! may be repointed at a different instance (a failover or migration). The
//! watchdog re-resolves the domain on a fixed period; when the resolved
//! instance no longer matches the cached one it closes the cache and every
//! socket opened through it, forcing the application to reconnect and pick
//! up the new instance. Resolution errors leave everything running on the
//! last known instance.

use crate::cache::ConnectionInfoCache;
use crate::connect::transport::SocketState;
use crate::dns::{DnsInstanceNameResolver, DnsResolver};
use crate::instance::{ConnectionInfo, ConnectionMetadata};
use crate::Result;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// A `ConnectionInfoCache` plus the watchdog and socket registry for its
/// domain, when one is configured.
pub struct MonitoredCache {
    cache: ConnectionInfoCache,
    sockets: Mutex<Vec<Weak<SocketState>>>,
}

impl MonitoredCache {
    /// Wrap a cache, spawning the watchdog task if the configuration names a
    /// domain. For literal instance names no task is spawned and socket
    /// registration is a no-op.
    pub fn new(
        cache: ConnectionInfoCache,
        resolver: Arc<dyn DnsResolver>,
        failover_period: Duration,
    ) -> Arc<Self> {
        let monitored = Arc::new(Self {
            cache,
            sockets: Mutex::new(Vec::new()),
        });
        if monitored.cache.config().domain_name.is_some() {
            let weak = Arc::downgrade(&monitored);
            tokio::spawn(Self::watchdog(weak, resolver, failover_period));
        }
        monitored
    }

    async fn watchdog(
        weak: Weak<Self>,
        resolver: Arc<dyn DnsResolver>,
        failover_period: Duration,
    ) {
        let name_resolver = DnsInstanceNameResolver::new(resolver);
        loop {
            tokio::time::sleep(failover_period).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            if this.cache.is_closed() {
                return;
            }
            this.prune_sockets();

            let Some(domain) = this.cache.config().domain_name.clone() else {
                return;
            };
            match name_resolver.resolve(&domain).await {
                Ok(resolved) => {
                    let cached = this.cache.instance_name().connection_name();
                    if resolved.connection_name() != cached {
                        tracing::info!(
                            domain,
                            old = cached,
                            new = resolved.connection_name(),
                            "domain no longer points at the cached instance, \
                             closing its connections"
                        );
                        this.close();
                        return;
                    }
                }
                Err(e) => {
                    // Keep serving the last known instance; transient DNS
                    // trouble must not kill healthy connections.
                    tracing::debug!(
                        domain,
                        error = %e,
                        "domain resolution failed, keeping current instance"
                    );
                }
            }
        }
    }

    /// Register a socket for closure on failover. Only meaningful for
    /// domain-named configurations; otherwise the socket is not tracked.
    pub fn add_socket(&self, state: &Arc<SocketState>) {
        if self.cache.config().domain_name.is_none() {
            return;
        }
        self.sockets.lock().unwrap().push(Arc::downgrade(state));
    }

    fn prune_sockets(&self) {
        self.sockets
            .lock()
            .unwrap()
            .retain(|weak| weak.upgrade().is_some_and(|s| !s.is_closed()));
    }

    /// Close the cache and every tracked socket.
    pub fn close(&self) {
        self.cache.close();
        let sockets = std::mem::take(&mut *self.sockets.lock().unwrap());
        for weak in sockets {
            if let Some(state) = weak.upgrade() {
                state.mark_closed();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cache.is_closed()
    }

    pub async fn get_connection_info(&self, timeout: Duration) -> Result<Arc<ConnectionInfo>> {
        self.cache.get_connection_info(timeout).await
    }

    pub async fn get_connection_metadata(&self, timeout: Duration) -> Result<ConnectionMetadata> {
        self.cache.get_connection_metadata(timeout).await
    }

    pub fn force_refresh(&self) -> Result<()> {
        self.cache.force_refresh()
    }

    pub async fn refresh_if_expired(&self) -> Result<()> {
        self.cache.refresh_if_expired().await
    }

    pub fn cache(&self) -> &ConnectionInfoCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::FakeRepository;
    use crate::config::ConnectionConfig;
    use crate::dns::SrvRecord;
    use crate::instance::InstanceName;
    use futures::future::BoxFuture;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Resolver that switches the SRV target after `flip_after` lookups.
    struct FlippingResolver {
        lookups: AtomicU32,
        flip_after: u32,
        before: &'static str,
        after: &'static str,
        fail: bool,
    }

    impl DnsResolver for FlippingResolver {
        fn resolve_srv<'a>(&'a self, _domain: &'a str) -> BoxFuture<'a, Result<Vec<SrvRecord>>> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if self.fail {
                    return Err(crate::Error::Transient("SERVFAIL".into()));
                }
                let target = if n < self.flip_after {
                    self.before
                } else {
                    self.after
                };
                Ok(vec![SrvRecord {
                    priority: 0,
                    weight: 0,
                    port: 3307,
                    target: format!("{}.", target),
                }])
            })
        }

        fn resolve_host<'a>(&'a self, _host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>> {
            Box::pin(async move { Ok(vec![]) })
        }
    }

    fn domain_cache() -> ConnectionInfoCache {
        let config = ConnectionConfig::for_domain("db.example.com");
        let name = InstanceName::parse_with_domain("p:r:i", Some("db.example.com")).unwrap();
        ConnectionInfoCache::new(
            config,
            name,
            Arc::new(FakeRepository::new()),
            Duration::from_millis(100),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_change_closes_cache_and_sockets() {
        let resolver = Arc::new(FlippingResolver {
            lookups: AtomicU32::new(0),
            flip_after: 1,
            before: "p:r:i",
            after: "p:r:failover-replica",
            fail: false,
        });
        let monitored = MonitoredCache::new(domain_cache(), resolver, Duration::from_secs(30));

        let socket = SocketState::new();
        monitored.add_socket(&socket);

        // First tick sees the unchanged name, second sees the new one.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!monitored.is_closed());
        assert!(!socket.is_closed());

        tokio::time::sleep(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert!(monitored.is_closed());
        assert!(socket.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dns_failure_keeps_everything_open() {
        let resolver = Arc::new(FlippingResolver {
            lookups: AtomicU32::new(0),
            flip_after: 0,
            before: "p:r:i",
            after: "p:r:i",
            fail: true,
        });
        let monitored = MonitoredCache::new(domain_cache(), resolver, Duration::from_secs(30));

        let socket = SocketState::new();
        monitored.add_socket(&socket);

        tokio::time::sleep(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert!(!monitored.is_closed());
        assert!(!socket.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_instance_keeps_sockets_open() {
        let resolver = Arc::new(FlippingResolver {
            lookups: AtomicU32::new(0),
            flip_after: u32::MAX,
            before: "p:r:i",
            after: "p:r:i",
            fail: false,
        });
        let monitored = MonitoredCache::new(domain_cache(), resolver, Duration::from_secs(30));

        let socket = SocketState::new();
        monitored.add_socket(&socket);

        tokio::time::sleep(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert!(!monitored.is_closed());
        assert!(!socket.is_closed());
    }

    #[tokio::test]
    async fn test_literal_name_config_tracks_nothing() {
        let config = ConnectionConfig::new("p:r:i");
        let name = InstanceName::parse("p:r:i").unwrap();
        let cache = ConnectionInfoCache::new(
            config,
            name,
            Arc::new(FakeRepository::new()),
            Duration::from_millis(100),
        );
        let resolver = Arc::new(FlippingResolver {
            lookups: AtomicU32::new(0),
            flip_after: 0,
            before: "p:r:i",
            after: "p:r:i",
            fail: false,
        });
        let monitored = MonitoredCache::new(cache, resolver, Duration::from_secs(30));

        let socket = SocketState::new();
        monitored.add_socket(&socket);
        assert!(monitored.sockets.lock().unwrap().is_empty());
        monitored.close();
    }

    #[tokio::test]
    async fn test_close_marks_tracked_sockets() {
        let resolver = Arc::new(FlippingResolver {
            lookups: AtomicU32::new(0),
            flip_after: u32::MAX,
            before: "p:r:i",
            after: "p:r:i",
            fail: false,
        });
        let monitored = MonitoredCache::new(domain_cache(), resolver, Duration::from_secs(30));

        let socket = SocketState::new();
        monitored.add_socket(&socket);
        monitored.close();
        assert!(socket.is_closed());
        assert!(monitored.is_closed());
    }
}
