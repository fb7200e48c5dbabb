//! Instance connection name parsing.
//!
//! A connection name has the form `PROJECT:REGION:INSTANCE`. Some legacy
//! project ids are domain-scoped (e.g. `example.com:project:region:instance`),
//! so a four-segment form is accepted with the first two segments joined as
//! the project id.

use crate::{Error, Result};

/// Parsed identity of a cloud SQL instance.
///
/// Immutable once constructed; an invalid format is a construction-time
/// error. When the instance was located through a DNS domain name, the
/// domain is carried alongside the parsed name so the trust layer can
/// validate the server certificate against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceName {
    connection_name: String,
    project_id: String,
    region_id: String,
    instance_id: String,
    domain_name: Option<String>,
}

impl InstanceName {
    /// Parse a `PROJECT:REGION:INSTANCE` connection name.
    pub fn parse(connection_name: &str) -> Result<Self> {
        Self::parse_with_domain(connection_name, None)
    }

    /// Parse a connection name, recording the domain name it was resolved
    /// from (if any).
    pub fn parse_with_domain(connection_name: &str, domain_name: Option<&str>) -> Result<Self> {
        let parts: Vec<&str> = connection_name.split(':').collect();
        let (project_id, region_id, instance_id) = match parts.as_slice() {
            [project, region, instance] => (project.to_string(), region, instance),
            // Legacy domain-scoped project id: "example.com:project"
            [scope, project, region, instance] => {
                (format!("{}:{}", scope, project), region, instance)
            }
            _ => return Err(invalid_name(connection_name)),
        };
        if project_id.split(':').any(str::is_empty)
            || region_id.is_empty()
            || instance_id.is_empty()
        {
            return Err(invalid_name(connection_name));
        }

        let domain_name = match domain_name {
            Some(d) if !d.is_empty() => {
                if !is_valid_domain(d) {
                    return Err(Error::Config(format!(
                        "[{}] domain name is invalid, expected a valid domain name",
                        d
                    )));
                }
                Some(d.to_string())
            }
            _ => None,
        };

        Ok(Self {
            connection_name: connection_name.to_string(),
            project_id,
            region_id: region_id.to_string(),
            instance_id: instance_id.to_string(),
            domain_name,
        })
    }

    /// The full `PROJECT:REGION:INSTANCE` string.
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The domain name this instance was resolved from, if any.
    pub fn domain_name(&self) -> Option<&str> {
        self.domain_name.as_deref()
    }

    /// The identity expected in the server certificate Common Name:
    /// `"<project>:<instance>"`.
    pub fn expected_common_name(&self) -> String {
        format!("{}:{}", self.project_id, self.instance_id)
    }
}

impl std::fmt::Display for InstanceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.connection_name)
    }
}

fn invalid_name(connection_name: &str) -> Error {
    Error::Config(format!(
        "[{}] instance connection name is invalid, expected a string in the form \
         \"<PROJECT_ID>:<REGION_ID>:<INSTANCE_ID>\"",
        connection_name
    ))
}

/// Validate a domain name in accordance with RFC 1035, RFC 1123 and RFC 2181:
/// 1-255 characters, dot-separated alphanumeric/hyphen labels that do not
/// start with a hyphen, and an alphabetic TLD of at least two characters.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 255 {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    for label in &labels {
        if label.is_empty() || label.starts_with('-') {
            return false;
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return false;
        }
    }
    let tld = labels[labels.len() - 1];
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}
