//! Credential refresh engine.
//!
//! Two interchangeable strategies keep a per-instance credential snapshot
//! usable: `RefreshAheadStrategy` refreshes on a background schedule before
//! expiry, `LazyRefreshStrategy` fetches on demand for platforms that freeze
//! background tasks. Both funnel their control-plane calls through the same
//! rate limiter and retry wrapper.

pub mod ahead;
pub mod calculator;
pub mod lazy;
pub mod rate_limit;
pub mod retry;

pub use ahead::{RefreshAheadStrategy, RefreshOperation};
pub use lazy::LazyRefreshStrategy;
pub use rate_limit::AsyncRateLimiter;
pub use retry::{api_client_is_fatal, BackoffRetry};

use crate::instance::ConnectionInfo;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// A configured refresh strategy for one instance.
pub enum Strategy {
    Ahead(RefreshAheadStrategy),
    Lazy(LazyRefreshStrategy),
}

impl Strategy {
    pub async fn get_connection_info(&self, timeout: Duration) -> Result<Arc<ConnectionInfo>> {
        match self {
            Strategy::Ahead(s) => s.get_connection_info(timeout).await,
            Strategy::Lazy(s) => s.get_connection_info(timeout).await,
        }
    }

    pub fn force_refresh(&self) -> Result<()> {
        match self {
            Strategy::Ahead(s) => s.force_refresh(),
            Strategy::Lazy(s) => s.force_refresh(),
        }
    }

    pub async fn refresh_if_expired(&self) -> Result<()> {
        match self {
            Strategy::Ahead(s) => s.refresh_if_expired().await,
            Strategy::Lazy(s) => s.refresh_if_expired().await,
        }
    }

    pub fn close(&self) {
        match self {
            Strategy::Ahead(s) => s.close(),
            Strategy::Lazy(s) => s.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Strategy::Ahead(s) => s.is_closed(),
            Strategy::Lazy(s) => s.is_closed(),
        }
    }
}
