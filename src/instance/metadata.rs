//! Instance metadata and credential snapshots.
//!
//! A `ConnectionInfo` is the unit produced by one refresh operation: the
//! instance metadata plus the short-lived client TLS material and its
//! expiration. Snapshots are immutable; a new refresh produces a new value
//! and never mutates an old one, so they are shared across tasks as
//! `Arc<ConnectionInfo>`.

use crate::instance::InstanceName;
use crate::{Error, Result};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// The kind of network address an instance exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpKind {
    /// Public (internet-routable) address.
    Public,
    /// Private VPC address.
    Private,
    /// Private Service Connect endpoint.
    Psc,
}

impl std::fmt::Display for IpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Private => write!(f, "private"),
            Self::Psc => write!(f, "psc"),
        }
    }
}

/// Instance metadata fetched from the control plane. Immutable once built.
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
    instance_name: InstanceName,
    ip_addrs: HashMap<IpKind, String>,
    server_ca_certs: Vec<CertificateDer<'static>>,
    dns_name: Option<String>,
    psc_enabled: bool,
    /// MDX capabilities advertised by the server, e.g. `CLIENT_PROTOCOL_TYPE`.
    mdx_protocol_support: Vec<String>,
}

impl InstanceMetadata {
    pub fn new(
        instance_name: InstanceName,
        ip_addrs: HashMap<IpKind, String>,
        server_ca_certs: Vec<CertificateDer<'static>>,
        dns_name: Option<String>,
        psc_enabled: bool,
        mdx_protocol_support: Vec<String>,
    ) -> Self {
        Self {
            instance_name,
            ip_addrs,
            server_ca_certs,
            dns_name,
            psc_enabled,
            mdx_protocol_support,
        }
    }

    pub fn instance_name(&self) -> &InstanceName {
        &self.instance_name
    }

    pub fn ip_addrs(&self) -> &HashMap<IpKind, String> {
        &self.ip_addrs
    }

    pub fn server_ca_certs(&self) -> &[CertificateDer<'static>] {
        &self.server_ca_certs
    }

    /// The DNS name the control plane reports for this instance, if any.
    pub fn dns_name(&self) -> Option<&str> {
        self.dns_name.as_deref()
    }

    pub fn psc_enabled(&self) -> bool {
        self.psc_enabled
    }

    /// Whether the server supports the client-protocol-type metadata
    /// exchange.
    pub fn supports_mdx_client_protocol(&self) -> bool {
        self.mdx_protocol_support
            .iter()
            .any(|s| s == "CLIENT_PROTOCOL_TYPE")
    }
}

/// Parse a PEM bundle of certificates, as delivered by the control plane.
pub fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem.as_bytes());
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| Error::Config(format!("invalid PEM certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Config(
            "no certificates found in PEM input".to_string(),
        ));
    }
    Ok(certs)
}

/// Short-lived client-side TLS material issued by the control plane.
#[derive(Debug)]
pub struct TlsMaterial {
    /// Ephemeral client certificate chain, leaf first.
    pub client_cert_chain: Vec<CertificateDer<'static>>,
    /// Private key matching the leaf certificate.
    pub client_key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// Build TLS material from the PEM-encoded ephemeral certificate and
    /// key, the format control planes hand back.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let client_cert_chain = certs_from_pem(cert_pem)?;
        let mut reader = std::io::BufReader::new(key_pem.as_bytes());
        let client_key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| Error::Config(format!("invalid PEM private key: {}", e)))?
            .ok_or_else(|| Error::Config("no private key found in PEM input".to_string()))?;
        Ok(Self {
            client_cert_chain,
            client_key,
        })
    }
}

/// The results of one certificate and metadata refresh operation.
#[derive(Debug)]
pub struct ConnectionInfo {
    metadata: InstanceMetadata,
    tls_material: TlsMaterial,
    expiration: SystemTime,
}

impl ConnectionInfo {
    pub fn new(
        metadata: InstanceMetadata,
        tls_material: TlsMaterial,
        expiration: SystemTime,
    ) -> Self {
        Self {
            metadata,
            tls_material,
            expiration,
        }
    }

    pub fn metadata(&self) -> &InstanceMetadata {
        &self.metadata
    }

    pub fn tls_material(&self) -> &TlsMaterial {
        &self.tls_material
    }

    /// When the ephemeral client certificate expires.
    pub fn expiration(&self) -> SystemTime {
        self.expiration
    }

    /// Resolve the first address matching the caller's IP kind preference
    /// order.
    pub fn preferred_ip(&self, preference: &[IpKind]) -> Result<&str> {
        for kind in preference {
            if let Some(addr) = self.metadata.ip_addrs().get(kind) {
                return Ok(addr.as_str());
            }
        }
        let wanted: Vec<String> = preference.iter().map(|k| k.to_string()).collect();
        Err(Error::Config(format!(
            "[{}] instance does not have any IP addresses matching preferences ({})",
            self.metadata.instance_name(),
            wanted.join(",")
        )))
    }
}

/// Everything the connect path needs to open one socket: the address to
/// dial and the TLS identity expectations. Assembled by the cache from the
/// current `ConnectionInfo` snapshot.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// The address chosen from the snapshot's IP map.
    pub preferred_ip: String,
    /// DNS name to validate the server certificate against, when known.
    pub server_dns_name: Option<String>,
    /// Identity expected in the legacy certificate Common Name.
    pub expected_common_name: String,
    /// Whether the server advertises MDX client-protocol-type support.
    pub mdx_supported: bool,
}
