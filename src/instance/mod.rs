//! Instance identity and metadata
//!
//! This module handles:
//! * Connection name parsing (`PROJECT:REGION:INSTANCE`)
//! * Domain name validation
//! * Metadata and credential snapshots produced by a refresh

mod metadata;
mod name;

pub use metadata::{
    certs_from_pem, ConnectionInfo, ConnectionMetadata, InstanceMetadata, IpKind, TlsMaterial,
};
pub use name::{is_valid_domain, InstanceName};
