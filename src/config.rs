//! Broker configuration
//!
//! `ConnectionConfig` identifies one logical instance configuration and is
//! used verbatim as the registry cache key, so equality and hashing are
//! structural. `ConnectorConfig` carries the process-wide knobs shared by
//! every cache the connector owns.

use crate::instance::IpKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default ordered IP kind preference.
pub const DEFAULT_IP_PREFERENCE: &[IpKind] = &[IpKind::Public, IpKind::Private];

/// How the broker authenticates the database user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Built-in database password authentication.
    #[default]
    Password,
    /// IAM-based automatic authentication using short-lived access tokens.
    Iam,
}

/// Which refresh strategy keeps the credential snapshot warm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshStrategyKind {
    /// Background-scheduled refresh ahead of expiry.
    #[default]
    RefreshAhead,
    /// On-demand refresh, blocking the caller when stale. No background
    /// tasks; suited to environments that throttle idle CPU.
    Lazy,
}

/// The client protocol type reported during the metadata exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MdxProtocol {
    Tcp,
    Tls,
    Uds,
}

/// Per-instance connection configuration and registry cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionConfig {
    /// Literal instance connection name (`PROJECT:REGION:INSTANCE`), if set.
    pub connection_name: Option<String>,
    /// Domain name to resolve into an instance name, if set.
    pub domain_name: Option<String>,
    /// Authentication mode.
    pub auth_mode: AuthMode,
    /// Ordered IP kind preference.
    pub ip_preference: Vec<IpKind>,
    /// Refresh strategy selector.
    pub refresh_strategy: RefreshStrategyKind,
    /// Unix socket path override; bypasses TLS entirely when set.
    pub unix_socket_path: Option<PathBuf>,
    /// Suffix appended to the unix socket path when missing (some database
    /// engines expect a directory-style socket path).
    pub unix_socket_path_suffix: Option<String>,
    /// Client protocol type to announce via MDX, when the server supports it.
    pub mdx_protocol: Option<MdxProtocol>,
}

impl ConnectionConfig {
    /// Configuration for a literal instance connection name.
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: Some(connection_name.into()),
            domain_name: None,
            auth_mode: AuthMode::default(),
            ip_preference: DEFAULT_IP_PREFERENCE.to_vec(),
            refresh_strategy: RefreshStrategyKind::default(),
            unix_socket_path: None,
            unix_socket_path_suffix: None,
            mdx_protocol: None,
        }
    }

    /// Configuration for an instance located through a DNS domain name.
    pub fn for_domain(domain_name: impl Into<String>) -> Self {
        let mut config = Self::new(String::new());
        config.connection_name = None;
        config.domain_name = Some(domain_name.into());
        config
    }

    /// Create a builder for advanced configuration.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Copy of this config with the connection name replaced.
    pub fn with_connection_name(&self, connection_name: Option<String>) -> Self {
        let mut config = self.clone();
        config.connection_name = connection_name;
        config
    }

    /// Copy of this config with the domain name replaced.
    pub fn with_domain_name(&self, domain_name: Option<String>) -> Self {
        let mut config = self.clone();
        config.domain_name = domain_name;
        config
    }

    /// Human-readable identity for log messages and errors.
    pub fn display_name(&self) -> &str {
        self.connection_name
            .as_deref()
            .or(self.domain_name.as_deref())
            .unwrap_or("<unconfigured>")
    }
}

/// Builder for `ConnectionConfig`.
#[derive(Debug, Default)]
pub struct ConnectionConfigBuilder {
    connection_name: Option<String>,
    domain_name: Option<String>,
    auth_mode: AuthMode,
    ip_preference: Option<Vec<IpKind>>,
    refresh_strategy: RefreshStrategyKind,
    unix_socket_path: Option<PathBuf>,
    unix_socket_path_suffix: Option<String>,
    mdx_protocol: Option<MdxProtocol>,
}

impl ConnectionConfigBuilder {
    /// Set the literal instance connection name.
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    /// Set the domain name to resolve into an instance name.
    pub fn domain_name(mut self, name: impl Into<String>) -> Self {
        self.domain_name = Some(name.into());
        self
    }

    pub fn auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }

    /// Set the ordered IP kind preference (default: public, private).
    pub fn ip_preference(mut self, preference: Vec<IpKind>) -> Self {
        self.ip_preference = Some(preference);
        self
    }

    pub fn refresh_strategy(mut self, kind: RefreshStrategyKind) -> Self {
        self.refresh_strategy = kind;
        self
    }

    pub fn unix_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_socket_path = Some(path.into());
        self
    }

    pub fn unix_socket_path_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.unix_socket_path_suffix = Some(suffix.into());
        self
    }

    pub fn mdx_protocol(mut self, protocol: MdxProtocol) -> Self {
        self.mdx_protocol = Some(protocol);
        self
    }

    pub fn build(self) -> ConnectionConfig {
        ConnectionConfig {
            connection_name: self.connection_name,
            domain_name: self.domain_name,
            auth_mode: self.auth_mode,
            ip_preference: self
                .ip_preference
                .unwrap_or_else(|| DEFAULT_IP_PREFERENCE.to_vec()),
            refresh_strategy: self.refresh_strategy,
            unix_socket_path: self.unix_socket_path,
            unix_socket_path_suffix: self.unix_socket_path_suffix,
            mdx_protocol: self.mdx_protocol,
        }
    }
}

/// Process-wide connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Minimum interval between refresh attempts for one instance.
    pub min_refresh_interval: Duration,
    /// Default budget for a caller waiting on a credential snapshot.
    pub refresh_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Poll interval for the domain-failover watchdog.
    pub failover_period: Duration,
    /// Port the server-side proxy listens on.
    pub server_proxy_port: u16,
    /// User agent announced in the metadata exchange.
    pub user_agent: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            min_refresh_interval: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(10),
            failover_period: Duration::from_secs(30),
            server_proxy_port: 3307,
            user_agent: format!("cloudsql-broker/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}
