//! Background-scheduled refresh strategy.
//!
//! Keeps a per-instance credential snapshot warm by refreshing it before
//! expiry on a scheduled timer. All mutation of the per-instance record goes
//! through one lock; waiters are woken through a watch channel. At most one
//! refresh attempt is in flight at any time; a `force_refresh` arriving
//! while one runs is absorbed rather than issuing a duplicate call.

use crate::instance::ConnectionInfo;
use crate::refresh::{calculator, AsyncRateLimiter};
use crate::{Error, Result};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Timeout used when the connect path checks for an expired certificate.
const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(45);

/// The operation that produces a fresh credential snapshot (the slow
/// control-plane call, already wrapped in retry logic by the caller).
pub type RefreshOperation =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<ConnectionInfo>>> + Send + Sync>;

/// The snapshot slot visible to callers.
enum Slot {
    /// The first refresh has not resolved yet.
    Pending,
    /// Last refresh succeeded; superseded values stay valid for callers
    /// still holding them.
    Ready(Arc<ConnectionInfo>),
    /// A terminal failure stopped the refresh schedule; surfaced to every
    /// caller until the configuration changes.
    Failed(String),
}

struct State {
    current: Slot,
    /// True from the moment an attempt is submitted until it succeeds or
    /// fails terminally; immediate retries after transient failures keep it
    /// set so `force_refresh` keeps balking.
    refresh_running: bool,
    last_failure: Option<String>,
    /// Scheduled-but-not-started next attempt, cancellable by
    /// `force_refresh` and `close`.
    scheduled: Option<JoinHandle<()>>,
    closed: bool,
}

struct Inner {
    name: String,
    refresh_op: RefreshOperation,
    rate_limiter: AsyncRateLimiter,
    state: Mutex<State>,
    changed: watch::Sender<u64>,
    weak: Weak<Inner>,
}

/// Handles periodic refresh operations for one instance.
///
/// Construction immediately starts the first refresh attempt, so must run
/// inside a tokio runtime.
pub struct RefreshAheadStrategy {
    inner: Arc<Inner>,
}

impl RefreshAheadStrategy {
    pub fn new(name: impl Into<String>, refresh_op: RefreshOperation, rate_limiter: AsyncRateLimiter) -> Self {
        let (changed, _) = watch::channel(0);
        let inner = Arc::new_cyclic(|weak| Inner {
            name: name.into(),
            refresh_op,
            rate_limiter,
            state: Mutex::new(State {
                current: Slot::Pending,
                refresh_running: false,
                last_failure: None,
                scheduled: None,
                closed: false,
            }),
            changed,
            weak: weak.clone(),
        });
        {
            let mut state = inner.state.lock().unwrap();
            inner.begin_attempt(&mut state);
        }
        Self { inner }
    }

    /// Returns the current snapshot, waiting up to `timeout` for an
    /// in-flight refresh when none has resolved yet.
    ///
    /// On timeout the error carries the last recorded refresh failure,
    /// distinguishing "never succeeded" from "succeeded before, now stale".
    pub async fn get_connection_info(&self, timeout: Duration) -> Result<Arc<ConnectionInfo>> {
        let mut rx = self.inner.changed.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.inner.state.lock().unwrap();
                if state.closed {
                    return Err(Error::Closed(self.inner.name.clone()));
                }
                match &state.current {
                    Slot::Ready(info) => return Ok(Arc::clone(info)),
                    Slot::Failed(message) => return Err(Error::Terminal(message.clone())),
                    Slot::Pending => {}
                }
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(Error::Closed(self.inner.name.clone())),
                Err(_) => {
                    let state = self.inner.state.lock().unwrap();
                    let context = match &state.last_failure {
                        Some(failure) => {
                            format!("last refresh attempt failed: {}", failure)
                        }
                        None => "no refresh has completed".to_string(),
                    };
                    return Err(Error::Timeout { timeout, context });
                }
            }
        }
    }

    /// Start a new refresh immediately, unless one is already running (in
    /// which case this is a no-op and callers wait for that attempt). Any
    /// scheduled-but-not-started next attempt is cancelled.
    pub fn force_refresh(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed(self.inner.name.clone()));
        }
        if state.refresh_running {
            return Ok(());
        }
        if let Some(handle) = state.scheduled.take() {
            handle.abort();
        }
        tracing::debug!(
            "[{}] force refresh: scheduled refresh cancelled, starting new refresh immediately",
            self.inner.name
        );
        self.inner.begin_attempt(&mut state);
        Ok(())
    }

    /// Force a refresh if the cached client certificate has already expired
    /// (e.g. the host slept through the refresh window). The TLS handshake
    /// does not fail on an expired client certificate, so this runs before
    /// the connect path uses the snapshot.
    pub async fn refresh_if_expired(&self) -> Result<()> {
        let info = self.get_connection_info(DEFAULT_REFRESH_TIMEOUT).await?;
        if SystemTime::now() > info.expiration() {
            tracing::debug!(
                "[{}] client certificate has expired, starting refresh immediately",
                self.inner.name
            );
            self.force_refresh()?;
        }
        Ok(())
    }

    /// Cancel in-flight and scheduled attempts; subsequent calls fail fast.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        if let Some(handle) = state.scheduled.take() {
            handle.abort();
        }
        state.closed = true;
        drop(state);
        self.inner.notify();
        tracing::debug!("[{}] refresh strategy closed", self.inner.name);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }
}

impl Drop for RefreshAheadStrategy {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Submit a refresh attempt. The state lock must be held by the caller;
    /// `refresh_running` is set before the task is spawned so concurrent
    /// `force_refresh` calls balk until this attempt completes.
    fn begin_attempt(&self, state: &mut State) {
        state.refresh_running = true;
        if let Some(inner) = self.weak.upgrade() {
            tokio::spawn(async move { inner.run_attempt().await });
        }
    }

    async fn run_attempt(self: Arc<Self>) {
        tracing::debug!("[{}] refresh operation: acquiring rate limiter permit", self.name);
        self.rate_limiter.acquire().await;
        tracing::debug!("[{}] refresh operation: rate limiter permit acquired", self.name);
        if self.is_closed() {
            return;
        }
        let result = (self.refresh_op)().await;
        self.handle_refresh_result(result);
    }

    fn handle_refresh_result(&self, result: Result<Arc<ConnectionInfo>>) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        match result {
            Ok(info) => {
                let delay =
                    calculator::delay_until_next_refresh(SystemTime::now(), info.expiration());
                tracing::debug!(
                    "[{}] refresh operation: completed, next refresh scheduled in {:?}",
                    self.name,
                    delay
                );
                state.refresh_running = false;
                state.last_failure = None;
                state.current = Slot::Ready(info);
                if let Some(inner) = self.weak.upgrade() {
                    state.scheduled = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        inner.begin_scheduled_attempt();
                    }));
                }
            }
            Err(e) if e.is_terminal() => {
                tracing::debug!("[{}] refresh operation: failed, no retry: {}", self.name, e);
                state.refresh_running = false;
                state.last_failure = Some(e.to_string());
                state.current = Slot::Failed(e.to_string());
            }
            Err(e) => {
                tracing::debug!(
                    "[{}] refresh operation: failed, starting next refresh immediately: {}",
                    self.name,
                    e
                );
                state.last_failure = Some(e.to_string());
                // refresh_running stays set across the immediate retry.
                if let Some(inner) = self.weak.upgrade() {
                    tokio::spawn(async move { inner.run_attempt().await });
                }
            }
        }
        drop(state);
        self.notify();
    }

    fn begin_scheduled_attempt(self: Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.scheduled = None;
        self.begin_attempt(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceMetadata, InstanceName, IpKind, TlsMaterial};
    use rustls_pki_types::PrivateKeyDer;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::{mpsc, oneshot};

    fn snapshot(valid_for: Duration) -> Arc<ConnectionInfo> {
        let name = InstanceName::parse("p:r:i").unwrap();
        let mut ips = HashMap::new();
        ips.insert(IpKind::Public, "203.0.113.1".to_string());
        let metadata = InstanceMetadata::new(name, ips, vec![], None, false, vec![]);
        let material = TlsMaterial {
            client_cert_chain: vec![],
            client_key: PrivateKeyDer::Pkcs8(vec![0u8; 8].into()),
        };
        Arc::new(ConnectionInfo::new(
            metadata,
            material,
            SystemTime::now() + valid_for,
        ))
    }

    fn limiter() -> AsyncRateLimiter {
        AsyncRateLimiter::new(Duration::from_millis(100))
    }

    /// Refresh operation controlled by the test: every invocation sends a
    /// oneshot the test resolves with the attempt's result.
    type AttemptRx = mpsc::UnboundedReceiver<oneshot::Sender<Result<Arc<ConnectionInfo>>>>;

    fn controlled_op() -> (RefreshOperation, AttemptRx, Arc<AtomicU32>) {
        let (call_tx, call_rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicU32::new(0));
        let op_count = Arc::clone(&count);
        let op: RefreshOperation = Arc::new(move || {
            let call_tx = call_tx.clone();
            op_count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let (tx, rx) = oneshot::channel();
                call_tx.send(tx).unwrap();
                rx.await.unwrap()
            })
        });
        (op, call_rx, count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_refresh_resolves_waiters() {
        let (op, mut attempts, _) = controlled_op();
        let strategy = RefreshAheadStrategy::new("p:r:i", op, limiter());

        let attempt = attempts.recv().await.unwrap();
        attempt.send(Ok(snapshot(Duration::from_secs(3600)))).unwrap();

        let info = strategy
            .get_connection_info(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(info.expiration() > SystemTime::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_absorbed_while_running() {
        let (op, mut attempts, count) = controlled_op();
        let strategy = RefreshAheadStrategy::new("p:r:i", op, limiter());

        let attempt = attempts.recv().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Both arrive while the first attempt runs: absorbed, no new calls.
        strategy.force_refresh().unwrap();
        strategy.force_refresh().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        attempt.send(Ok(snapshot(Duration::from_secs(3600)))).unwrap();
        strategy
            .get_connection_info(Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_cancels_scheduled_attempt() {
        let (op, mut attempts, count) = controlled_op();
        let strategy = RefreshAheadStrategy::new("p:r:i", op, limiter());

        let attempt = attempts.recv().await.unwrap();
        attempt.send(Ok(snapshot(Duration::from_secs(3600)))).unwrap();
        strategy
            .get_connection_info(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Next attempt is scheduled ~26 minutes out; force one now instead.
        strategy.force_refresh().unwrap();
        let attempt = attempts.recv().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        attempt.send(Ok(snapshot(Duration::from_secs(3600)))).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_refresh_fires_after_calculated_delay() {
        let (op, mut attempts, count) = controlled_op();
        let strategy = RefreshAheadStrategy::new("p:r:i", op, limiter());

        // 70-minute certificate: next refresh at half lifetime, 35 minutes.
        let attempt = attempts.recv().await.unwrap();
        attempt
            .send(Ok(snapshot(Duration::from_secs(70 * 60))))
            .unwrap();
        strategy
            .get_connection_info(Duration::from_secs(1))
            .await
            .unwrap();

        let attempt = attempts.recv().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        attempt.send(Ok(snapshot(Duration::from_secs(3600)))).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_error_reports_last_failure() {
        let (op, mut attempts, _) = controlled_op();
        let strategy = RefreshAheadStrategy::new("p:r:i", op, limiter());

        let attempt = attempts.recv().await.unwrap();
        attempt
            .send(Err(Error::Transient("api returned 503".into())))
            .unwrap();
        // The failed attempt retries immediately; leave it hanging.
        let _pending = attempts.recv().await.unwrap();

        let err = strategy
            .get_connection_info(Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            Error::Timeout { context, .. } => {
                assert!(context.contains("api returned 503"), "context: {}", context);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_before_any_failure_reports_no_refresh() {
        let (op, mut attempts, _) = controlled_op();
        let strategy = RefreshAheadStrategy::new("p:r:i", op, limiter());
        let _pending = attempts.recv().await.unwrap();

        let err = strategy
            .get_connection_info(Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            Error::Timeout { context, .. } => {
                assert!(context.contains("no refresh has completed"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_stops_scheduling() {
        let (op, mut attempts, count) = controlled_op();
        let strategy = RefreshAheadStrategy::new("p:r:i", op, limiter());

        let attempt = attempts.recv().await.unwrap();
        attempt
            .send(Err(Error::Terminal("instance not supported".into())))
            .unwrap();

        let err = strategy
            .get_connection_info(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Terminal(_)));
        assert!(err.to_string().contains("instance not supported"));

        // No further attempts, even after plenty of time.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retries_immediately() {
        let (op, mut attempts, count) = controlled_op();
        let strategy = RefreshAheadStrategy::new("p:r:i", op, limiter());

        let attempt = attempts.recv().await.unwrap();
        attempt.send(Err(Error::Transient("flake".into()))).unwrap();

        let attempt = attempts.recv().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        attempt.send(Ok(snapshot(Duration::from_secs(3600)))).unwrap();
        strategy
            .get_connection_info(Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_fast() {
        let (op, mut attempts, _) = controlled_op();
        let strategy = RefreshAheadStrategy::new("p:r:i", op, limiter());
        let _pending = attempts.recv().await.unwrap();

        strategy.close();
        assert!(strategy.is_closed());

        let err = strategy
            .get_connection_info(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        assert!(matches!(strategy.force_refresh(), Err(Error::Closed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_if_expired_forces_refresh() {
        let (op, mut attempts, count) = controlled_op();
        let strategy = RefreshAheadStrategy::new("p:r:i", op, limiter());

        // Already-expired snapshot, as after a long host sleep.
        let attempt = attempts.recv().await.unwrap();
        let name = InstanceName::parse("p:r:i").unwrap();
        let metadata = InstanceMetadata::new(name, HashMap::new(), vec![], None, false, vec![]);
        let material = TlsMaterial {
            client_cert_chain: vec![],
            client_key: PrivateKeyDer::Pkcs8(vec![0u8; 8].into()),
        };
        let expired = Arc::new(ConnectionInfo::new(
            metadata,
            material,
            SystemTime::now() - Duration::from_secs(10),
        ));
        attempt.send(Ok(expired)).unwrap();
        strategy
            .get_connection_info(Duration::from_secs(1))
            .await
            .unwrap();

        // The scheduled attempt would also fire (delay 0); either way a
        // second refresh must start promptly.
        strategy.refresh_if_expired().await.unwrap();
        let _attempt = attempts.recv().await.unwrap();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
