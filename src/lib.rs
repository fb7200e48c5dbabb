//! Connection broker for managed cloud SQL instances.
//!
//! The broker authenticates sockets to database instances without static
//! credential files: it fetches instance metadata and short-lived client
//! certificates from a control plane, keeps them fresh ahead of expiry, and
//! dials the instance's server-side proxy over TLS pinned to the instance
//! identity. Domain-named instances are watched for failover and their
//! sockets retired when the domain moves.
//!
//! # Example
//!
//! ```no_run
//! use cloudsql_broker::{ConnectionConfig, Connector, ConnectorConfig};
//! use std::sync::Arc;
//!
//! # async fn run(repository: Arc<dyn cloudsql_broker::ConnectionInfoRepository>) -> cloudsql_broker::Result<()> {
//! let connector = Connector::new(repository, ConnectorConfig::default());
//! let config = ConnectionConfig::new("my-project:us-central1:my-instance");
//! let socket = connector.connect(&config).await?;
//! // Hand `socket` to the database driver.
//! # let _ = socket;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod connect;
pub mod dns;
mod error;
pub mod instance;
pub mod mdx;
pub mod refresh;
pub mod repository;
pub mod trust;

pub use cache::{ConnectionInfoCache, MonitoredCache};
pub use config::{
    AuthMode, ConnectionConfig, ConnectionConfigBuilder, ConnectorConfig, MdxProtocol,
    RefreshStrategyKind,
};
pub use connect::{Connector, SocketState, Transport};
pub use dns::{DnsInstanceNameResolver, DnsResolver, SrvRecord, SystemDnsResolver};
pub use error::{Error, Result};
pub use instance::{
    certs_from_pem, ConnectionInfo, ConnectionMetadata, InstanceMetadata, InstanceName, IpKind,
    TlsMaterial,
};
pub use repository::{AccessTokenSupplier, ConnectionInfoRepository};
