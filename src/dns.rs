//! DNS-based instance name resolution.
//!
//! A configuration may name an instance through a DNS domain instead of a
//! literal `PROJECT:REGION:INSTANCE` string. The domain's SRV record targets
//! carry instance connection names; the first target that parses wins.
//! Resolution mechanics live behind the `DnsResolver` trait so the embedding
//! application can plug in its own resolver (and tests can fake one).

use crate::instance::InstanceName;
use crate::{Error, Result};
use futures::future::BoxFuture;
use std::net::IpAddr;

/// The value of one SRV DNS record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

impl SrvRecord {
    /// Parse the textual form `"priority weight port target"`.
    pub fn parse(record: &str) -> Result<Self> {
        let mut fields = record.split_whitespace();
        let (priority, weight, port, target) = match (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) {
            (Some(p), Some(w), Some(port), Some(t)) => (p, w, port, t),
            _ => return Err(Error::Config(format!("malformed SRV record: {}", record))),
        };
        let parse_num = |s: &str| {
            s.parse::<u16>()
                .map_err(|_| Error::Config(format!("malformed SRV record: {}", record)))
        };
        Ok(Self {
            priority: parse_num(priority)?,
            weight: parse_num(weight)?,
            port: parse_num(port)?,
            target: target.to_string(),
        })
    }
}

/// Resolves DNS records. Transport mechanics are the implementor's concern.
pub trait DnsResolver: Send + Sync {
    /// Resolve the SRV records for a domain name.
    fn resolve_srv<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<SrvRecord>>>;

    /// Resolve a host name to its addresses.
    fn resolve_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>>;
}

impl<T: DnsResolver + ?Sized> DnsResolver for std::sync::Arc<T> {
    fn resolve_srv<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<SrvRecord>>> {
        (**self).resolve_srv(domain)
    }

    fn resolve_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>> {
        (**self).resolve_host(host)
    }
}

/// Resolver backed by the operating system's stub resolver.
///
/// Host lookup uses tokio's getaddrinfo wrapper. The system stub resolver
/// cannot query SRV records, so domain-based instance naming needs an
/// injected `DnsResolver` implementation.
#[derive(Debug, Default)]
pub struct SystemDnsResolver;

impl DnsResolver for SystemDnsResolver {
    fn resolve_srv<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<SrvRecord>>> {
        Box::pin(async move {
            Err(Error::Config(format!(
                "unable to resolve SRV record for \"{}\": the system resolver does not \
                 support SRV lookups, provide a DnsResolver implementation",
                domain
            )))
        })
    }

    fn resolve_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>> {
        Box::pin(async move {
            // Port is required by lookup_host but irrelevant to the answer.
            let addrs = tokio::net::lookup_host((host, 0))
                .await
                .map_err(|e| Error::Transient(format!("dns lookup for \"{}\" failed: {}", host, e)))?
                .map(|sa| sa.ip())
                .collect();
            Ok(addrs)
        })
    }
}

/// Resolves a configured name (literal instance name or domain) to an
/// `InstanceName` using SRV records.
pub struct DnsInstanceNameResolver<R> {
    resolver: R,
}

impl<R: DnsResolver> DnsInstanceNameResolver<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    /// Resolve `name` into an instance name.
    ///
    /// A well-formed `PROJECT:REGION:INSTANCE` string parses directly.
    /// Otherwise the name is treated as a domain: its SRV record targets are
    /// tried in order and the first one that parses as an instance name is
    /// returned, with the domain recorded on the result.
    pub async fn resolve(&self, name: &str) -> Result<InstanceName> {
        if let Ok(instance) = InstanceName::parse(name) {
            return Ok(instance);
        }

        let records = self.resolver.resolve_srv(name).await.map_err(|e| {
            Error::Config(format!("unable to resolve SRV record for \"{}\": {}", name, e))
        })?;

        for record in &records {
            let target = record.target.trim_end_matches('.');
            match InstanceName::parse_with_domain(target, Some(name)) {
                Ok(instance) => return Ok(instance),
                Err(e) => {
                    tracing::info!(
                        domain = name,
                        target = target,
                        error = %e,
                        "unable to parse instance name in SRV record target"
                    );
                }
            }
        }

        Err(Error::Config(format!(
            "unable to parse values of SRV record for \"{}\"",
            name
        )))
    }
}
