//! The connector: per-process registry of instance caches and the connect
//! path that turns a `ConnectionConfig` into a ready socket.
//!
//! Caches are memoized by configuration so every socket to the same instance
//! shares one refresh schedule. A failed connection attempt invalidates the
//! credential snapshot it used (the rate limiter bounds how often that can
//! hit the control plane); the caller retries through its driver.

pub mod transport;

pub use transport::{GuardedStream, SocketState, Transport};

use crate::cache::{ConnectionInfoCache, MonitoredCache};
use crate::config::{ConnectionConfig, ConnectorConfig, MdxProtocol};
use crate::dns::{DnsInstanceNameResolver, DnsResolver, SystemDnsResolver};
use crate::instance::InstanceName;
use crate::mdx::{self, ClientProtocolType, MdxStream, MetadataExchangeRequest};
use crate::repository::ConnectionInfoRepository;
use crate::{trust, Error, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;

/// Establishes broker-authenticated connections to database instances.
pub struct Connector {
    config: ConnectorConfig,
    repository: Arc<dyn ConnectionInfoRepository>,
    resolver: Arc<dyn DnsResolver>,
    instances: Mutex<HashMap<ConnectionConfig, Arc<MonitoredCache>>>,
}

impl Connector {
    pub fn new(repository: Arc<dyn ConnectionInfoRepository>, config: ConnectorConfig) -> Self {
        Self::with_resolver(repository, config, Arc::new(SystemDnsResolver))
    }

    /// Use a custom DNS resolver for domain-named instances (required for
    /// SRV lookups, which the system stub resolver cannot perform).
    pub fn with_resolver(
        repository: Arc<dyn ConnectionInfoRepository>,
        config: ConnectorConfig,
        resolver: Arc<dyn DnsResolver>,
    ) -> Self {
        Self {
            config,
            repository,
            resolver,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Open one connection for `config`.
    ///
    /// A unix socket path bypasses the broker protocol entirely. Otherwise
    /// the instance's cached credentials are used to dial the server-side
    /// proxy over TLS, pinned to the instance identity, with the metadata
    /// exchange run when both sides support it.
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<Transport> {
        #[cfg(unix)]
        if let Some(path) = &config.unix_socket_path {
            return self.connect_unix(config, path).await;
        }
        #[cfg(not(unix))]
        if config.unix_socket_path.is_some() {
            return Err(Error::Config(
                "unix socket paths are not supported on this platform".to_string(),
            ));
        }

        let cache = self.cache_for(config).await?;
        match self.connect_via_cache(config, &cache).await {
            Ok(transport) => Ok(transport),
            Err(e) => {
                // The snapshot that produced this failure is suspect; force
                // a refresh so the next attempt gets fresh credentials. The
                // strategy's rate limiter bounds the control-plane impact.
                tracing::debug!(
                    instance = config.display_name(),
                    error = %e,
                    "connection attempt failed, invalidating credential snapshot"
                );
                if let Err(refresh_err) = cache.force_refresh() {
                    tracing::debug!(
                        instance = config.display_name(),
                        error = %refresh_err,
                        "unable to invalidate credential snapshot"
                    );
                }
                Err(e)
            }
        }
    }

    /// Force the next connection to `config` to use fresh credentials.
    pub fn force_refresh(&self, config: &ConnectionConfig) -> Result<()> {
        let cache = {
            let instances = self.instances.lock().unwrap();
            instances.get(config).cloned()
        };
        match cache {
            Some(cache) => cache.force_refresh(),
            None => Ok(()),
        }
    }

    /// Close every cache and tracked socket. Subsequent connects rebuild
    /// caches from scratch.
    pub fn close(&self) {
        let instances = std::mem::take(&mut *self.instances.lock().unwrap());
        for cache in instances.into_values() {
            cache.close();
        }
    }

    /// The memoized cache for `config`, creating or replacing as needed.
    ///
    /// Domain-named configurations re-resolve on every call so a repointed
    /// domain is noticed on the connect path too, not only by the watchdog;
    /// a cache whose instance no longer matches is closed and replaced.
    async fn cache_for(&self, config: &ConnectionConfig) -> Result<Arc<MonitoredCache>> {
        if config.domain_name.is_none() {
            let instances = self.instances.lock().unwrap();
            if let Some(cache) = instances.get(config) {
                if !cache.is_closed() {
                    return Ok(Arc::clone(cache));
                }
            }
        }

        let instance_name = self.resolve_instance_name(config).await?;

        let mut instances = self.instances.lock().unwrap();
        if let Some(cache) = instances.get(config) {
            if !cache.is_closed()
                && cache.cache().instance_name().connection_name()
                    == instance_name.connection_name()
            {
                return Ok(Arc::clone(cache));
            }
            tracing::info!(
                instance = config.display_name(),
                old = cache.cache().instance_name().connection_name(),
                new = instance_name.connection_name(),
                "replacing instance cache"
            );
            cache.close();
            instances.remove(config);
        }

        let cache = ConnectionInfoCache::new(
            config.clone(),
            instance_name,
            Arc::clone(&self.repository),
            self.config.min_refresh_interval,
        );
        let monitored =
            MonitoredCache::new(cache, Arc::clone(&self.resolver), self.config.failover_period);
        instances.insert(config.clone(), Arc::clone(&monitored));
        Ok(monitored)
    }

    async fn resolve_instance_name(&self, config: &ConnectionConfig) -> Result<InstanceName> {
        match (&config.connection_name, &config.domain_name) {
            (Some(name), domain) => {
                if domain.is_some() {
                    tracing::debug!(
                        connection_name = name,
                        "both connection name and domain configured, using the \
                         connection name"
                    );
                }
                InstanceName::parse(name)
            }
            (None, Some(domain)) => {
                DnsInstanceNameResolver::new(Arc::clone(&self.resolver))
                    .resolve(domain)
                    .await
            }
            (None, None) => Err(Error::Config(
                "either a connection name or a domain name must be configured".to_string(),
            )),
        }
    }

    async fn connect_via_cache(
        &self,
        config: &ConnectionConfig,
        cache: &Arc<MonitoredCache>,
    ) -> Result<Transport> {
        cache.refresh_if_expired().await?;
        let info = cache.get_connection_info(self.config.refresh_timeout).await?;
        let metadata = cache
            .get_connection_metadata(self.config.refresh_timeout)
            .await?;

        // For domain-named configs, prefer the address the domain resolves
        // to right now; fall back to the snapshot's IP map.
        let fresh_ip = match &config.domain_name {
            Some(domain) => match self.resolver.resolve_host(domain).await {
                Ok(addrs) => addrs.into_iter().next(),
                Err(e) => {
                    tracing::debug!(
                        domain,
                        error = %e,
                        "domain address lookup failed, using instance metadata address"
                    );
                    None
                }
            },
            None => None,
        };
        let ip: IpAddr = match fresh_ip {
            Some(ip) => ip,
            None => metadata.preferred_ip.parse().map_err(|_| {
                Error::Config(format!(
                    "[{}] instance address {:?} is not a valid IP address",
                    config.display_name(),
                    metadata.preferred_ip
                ))
            })?,
        };
        let addr = SocketAddr::new(ip, self.config.server_proxy_port);

        tracing::debug!(instance = config.display_name(), address = %addr, "connecting");
        let tcp = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout {
                timeout: self.config.connect_timeout,
                context: format!("connecting to {}", addr),
            })??;
        tcp.set_nodelay(true)?;

        let tls_config = trust::client_tls_config(&info)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
        let server_name = match &metadata.server_dns_name {
            Some(dns) => rustls_pki_types::ServerName::try_from(dns.clone()).map_err(|_| {
                Error::Config(format!(
                    "[{}] instance DNS name {:?} is not a valid server name",
                    config.display_name(),
                    dns
                ))
            })?,
            None => rustls_pki_types::ServerName::IpAddress(ip.into()),
        };
        let tls = tokio::time::timeout(
            self.config.connect_timeout,
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| Error::Timeout {
            timeout: self.config.connect_timeout,
            context: format!("TLS handshake with {}", addr),
        })??;

        let stream = match (metadata.mdx_supported, config.mdx_protocol) {
            (true, Some(protocol)) => {
                let request = MetadataExchangeRequest {
                    user_agent: self.config.user_agent.clone(),
                    client_protocol_type: match protocol {
                        MdxProtocol::Tcp => ClientProtocolType::Tcp,
                        MdxProtocol::Tls => ClientProtocolType::Tls,
                        MdxProtocol::Uds => ClientProtocolType::Uds,
                    } as i32,
                };
                let frame = mdx::encode_frame(&request)?;
                MdxStream::new(tls, frame.to_vec())
            }
            _ => MdxStream::transparent(tls),
        };

        let state = SocketState::new();
        cache.add_socket(&state);
        tracing::debug!(instance = config.display_name(), address = %addr, "connected");
        Ok(Transport::Tls(Box::new(GuardedStream::new(state, stream))))
    }

    #[cfg(unix)]
    async fn connect_unix(
        &self,
        config: &ConnectionConfig,
        path: &std::path::Path,
    ) -> Result<Transport> {
        let mut path = path.to_path_buf();
        if let Some(suffix) = &config.unix_socket_path_suffix {
            if !path.ends_with(suffix.trim_start_matches('/')) {
                path.push(suffix.trim_start_matches('/'));
            }
        }
        tracing::debug!(
            instance = config.display_name(),
            path = %path.display(),
            "connecting over unix socket"
        );
        let stream = tokio::net::UnixStream::connect(&path).await?;
        Ok(Transport::Unix(GuardedStream::new(
            SocketState::new(),
            stream,
        )))
    }
}
