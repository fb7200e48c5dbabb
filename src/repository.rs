//! Control-plane seams.
//!
//! The broker never talks to a concrete control-plane API itself; the
//! embedding application supplies a `ConnectionInfoRepository` that fetches
//! instance metadata and mints ephemeral certificates, and (for IAM
//! authentication) an `AccessTokenSupplier`. Tests fake both.

use crate::config::AuthMode;
use crate::instance::{ConnectionInfo, InstanceName};
use crate::Result;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Fetches a fresh credential snapshot for an instance.
///
/// Implementations classify their failures through the crate error type:
/// `Error::Transient` for network errors and 5xx responses (the refresh
/// engine retries those with backoff), `Error::Terminal` for conditions
/// that will not heal without a configuration change.
pub trait ConnectionInfoRepository: Send + Sync {
    /// Perform one full refresh: metadata lookup plus ephemeral certificate
    /// issuance. `auth_mode` determines whether the certificate is bound to
    /// an IAM principal.
    fn fetch<'a>(
        &'a self,
        instance_name: &'a InstanceName,
        auth_mode: AuthMode,
    ) -> BoxFuture<'a, Result<Arc<ConnectionInfo>>>;
}

/// Supplies OAuth2 access tokens for IAM database authentication.
///
/// Returns `None` when the ambient credentials cannot produce a token, which
/// repositories treat as a configuration error for IAM-mode instances.
pub trait AccessTokenSupplier: Send + Sync {
    fn access_token(&self) -> BoxFuture<'_, Result<Option<String>>>;
}
