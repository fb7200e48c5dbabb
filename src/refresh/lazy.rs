//! On-demand refresh strategy for environments without background CPU.
//!
//! Serverless platforms may freeze a process between requests, so a
//! background refresh timer cannot be relied on to fire. This strategy
//! fetches a snapshot only when a caller asks for one and the cached value
//! is inside the staleness window, holding callers on an async lock so
//! concurrent demand produces exactly one control-plane call.

use crate::instance::ConnectionInfo;
use crate::refresh::ahead::RefreshOperation;
use crate::refresh::calculator::REFRESH_BUFFER;
use crate::{Error, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

struct State {
    info: Option<Arc<ConnectionInfo>>,
    closed: bool,
}

/// Refreshes the credential snapshot only when a caller needs it.
pub struct LazyRefreshStrategy {
    name: String,
    refresh_op: RefreshOperation,
    state: Mutex<State>,
    /// Serializes fetches; waiters behind the lock re-check the cache before
    /// issuing their own call.
    fetch_lock: tokio::sync::Mutex<()>,
}

impl LazyRefreshStrategy {
    pub fn new(name: impl Into<String>, refresh_op: RefreshOperation) -> Self {
        Self {
            name: name.into(),
            refresh_op,
            state: Mutex::new(State {
                info: None,
                closed: false,
            }),
            fetch_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the cached snapshot, fetching a new one if none exists or the
    /// cached one is within [`REFRESH_BUFFER`] of expiry.
    pub async fn get_connection_info(&self, timeout: Duration) -> Result<Arc<ConnectionInfo>> {
        tokio::time::timeout(timeout, self.current_or_fetch())
            .await
            .map_err(|_| Error::Timeout {
                timeout,
                context: "refresh operation did not complete".to_string(),
            })?
    }

    async fn current_or_fetch(&self) -> Result<Arc<ConnectionInfo>> {
        if let Some(info) = self.fresh_snapshot()? {
            return Ok(info);
        }

        let _guard = self.fetch_lock.lock().await;
        // Another caller may have fetched while this one waited.
        if let Some(info) = self.fresh_snapshot()? {
            return Ok(info);
        }

        tracing::debug!("[{}] fetching new connection info", self.name);
        let info = (self.refresh_op)().await?;
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed(self.name.clone()));
        }
        state.info = Some(Arc::clone(&info));
        Ok(info)
    }

    /// The cached snapshot, if present and not yet inside the staleness
    /// window.
    fn fresh_snapshot(&self) -> Result<Option<Arc<ConnectionInfo>>> {
        let state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed(self.name.clone()));
        }
        match &state.info {
            Some(info) if SystemTime::now() + REFRESH_BUFFER < info.expiration() => {
                Ok(Some(Arc::clone(info)))
            }
            _ => Ok(None),
        }
    }

    /// Discard the cached snapshot; the next caller fetches a new one.
    pub fn force_refresh(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed(self.name.clone()));
        }
        state.info = None;
        tracing::debug!("[{}] cached connection info discarded", self.name);
        Ok(())
    }

    /// Expiry is already handled on every `get_connection_info` call, so
    /// there is nothing extra for the connect path to do.
    pub async fn refresh_if_expired(&self) -> Result<()> {
        Ok(())
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.info = None;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}
