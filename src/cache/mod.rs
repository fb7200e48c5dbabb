//! Per-instance credential cache.
//!
//! One `ConnectionInfoCache` exists per distinct `ConnectionConfig`. It owns
//! the instance's refresh strategy and turns the current credential snapshot
//! into the `ConnectionMetadata` the connect path consumes. The registry in
//! the connector memoizes these by config, so all sockets to the same
//! instance share one refresh schedule.

pub mod monitored;

pub use monitored::MonitoredCache;

use crate::config::{ConnectionConfig, RefreshStrategyKind};
use crate::instance::{ConnectionInfo, ConnectionMetadata, InstanceName};
use crate::refresh::{
    api_client_is_fatal, AsyncRateLimiter, BackoffRetry, LazyRefreshStrategy,
    RefreshAheadStrategy, RefreshOperation, Strategy,
};
use crate::repository::ConnectionInfoRepository;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Caches `ConnectionInfo` snapshots for one instance configuration.
pub struct ConnectionInfoCache {
    config: ConnectionConfig,
    instance_name: InstanceName,
    strategy: Strategy,
}

impl ConnectionInfoCache {
    /// Build the cache and start its refresh strategy. For the refresh-ahead
    /// strategy the first fetch begins immediately.
    pub fn new(
        config: ConnectionConfig,
        instance_name: InstanceName,
        repository: Arc<dyn ConnectionInfoRepository>,
        min_refresh_interval: Duration,
    ) -> Self {
        let refresh_op = Self::refresh_operation(&config, &instance_name, repository);
        let name = instance_name.connection_name().to_string();
        let strategy = match config.refresh_strategy {
            RefreshStrategyKind::RefreshAhead => Strategy::Ahead(RefreshAheadStrategy::new(
                name,
                refresh_op,
                AsyncRateLimiter::new(min_refresh_interval),
            )),
            RefreshStrategyKind::Lazy => Strategy::Lazy(LazyRefreshStrategy::new(name, refresh_op)),
        };
        Self {
            config,
            instance_name,
            strategy,
        }
    }

    /// The control-plane call as the strategy sees it: repository fetch
    /// wrapped in backoff retry, with only repository-classified transient
    /// failures retried.
    fn refresh_operation(
        config: &ConnectionConfig,
        instance_name: &InstanceName,
        repository: Arc<dyn ConnectionInfoRepository>,
    ) -> RefreshOperation {
        let auth_mode = config.auth_mode;
        let instance_name = instance_name.clone();
        Arc::new(move || {
            let repository = Arc::clone(&repository);
            let instance_name = instance_name.clone();
            Box::pin(async move {
                BackoffRetry::default()
                    .call_with(
                        || {
                            let repository = Arc::clone(&repository);
                            let instance_name = instance_name.clone();
                            async move { repository.fetch(&instance_name, auth_mode).await }
                        },
                        api_client_is_fatal,
                    )
                    .await
            })
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn instance_name(&self) -> &InstanceName {
        &self.instance_name
    }

    /// The current credential snapshot, for TLS config assembly.
    pub async fn get_connection_info(&self, timeout: Duration) -> Result<Arc<ConnectionInfo>> {
        self.strategy.get_connection_info(timeout).await
    }

    /// Everything the connect path needs for one attempt, resolved from the
    /// current snapshot: dial address per the configured IP preference, TLS
    /// identity expectations, and MDX support.
    pub async fn get_connection_metadata(&self, timeout: Duration) -> Result<ConnectionMetadata> {
        let info = self.strategy.get_connection_info(timeout).await?;
        let preferred_ip = info.preferred_ip(&self.config.ip_preference)?.to_string();
        let server_dns_name = info
            .metadata()
            .dns_name()
            .or_else(|| self.instance_name.domain_name())
            .map(str::to_string);
        Ok(ConnectionMetadata {
            preferred_ip,
            server_dns_name,
            expected_common_name: self.instance_name.expected_common_name(),
            mdx_supported: info.metadata().supports_mdx_client_protocol(),
        })
    }

    pub fn force_refresh(&self) -> Result<()> {
        self.strategy.force_refresh()
    }

    /// Force a refresh when the cached client certificate has expired, as
    /// after a long host suspend.
    pub async fn refresh_if_expired(&self) -> Result<()> {
        self.strategy.refresh_if_expired().await
    }

    pub fn close(&self) {
        self.strategy.close();
    }

    pub fn is_closed(&self) -> bool {
        self.strategy.is_closed()
    }
}
