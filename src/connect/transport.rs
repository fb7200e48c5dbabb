//! Broker-established socket types.
//!
//! Every socket the broker hands out carries a shared `SocketState` flag the
//! domain-failover watchdog can flip; once flipped, the next read or write
//! fails with `ConnectionAborted` so the driver retires the connection
//! instead of talking to an instance the domain no longer points at.

use crate::mdx::MdxStream;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::client::TlsStream;

/// Kill-switch shared between a socket and the failover watchdog.
#[derive(Debug, Default)]
pub struct SocketState {
    closed: AtomicBool,
}

impl SocketState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Flip the switch; in-flight and future I/O on the guarded socket fails.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn aborted() -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "connection closed: the instance behind this connection changed",
    )
}

/// A stream whose I/O is vetoed by a [`SocketState`] flag.
#[derive(Debug)]
pub struct GuardedStream<S> {
    state: Arc<SocketState>,
    inner: S,
}

impl<S> GuardedStream<S> {
    pub fn new(state: Arc<SocketState>, inner: S) -> Self {
        Self { state, inner }
    }

    pub fn socket_state(&self) -> &Arc<SocketState> {
        &self.state
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for GuardedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state.is_closed() {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for GuardedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.state.is_closed() {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state.is_closed() {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Shutdown is allowed regardless of the flag.
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A socket the broker established, ready to carry database traffic.
#[derive(Debug)]
pub enum Transport {
    /// TLS tunnel to the server-side proxy, MDX handling included.
    Tls(Box<GuardedStream<MdxStream<TlsStream<TcpStream>>>>),
    /// Direct unix socket, bypassing the proxy protocol entirely.
    #[cfg(unix)]
    Unix(GuardedStream<UnixStream>),
}

impl Transport {
    pub fn socket_state(&self) -> &Arc<SocketState> {
        match self {
            Transport::Tls(s) => s.socket_state(),
            #[cfg(unix)]
            Transport::Unix(s) => s.socket_state(),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            #[cfg(unix)]
            Transport::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
