//! Crate-wide error type.
//!
//! Failures are classified the way the refresh machinery needs them:
//! configuration errors fail immediately, terminal errors stop the refresh
//! schedule, transient errors are retried with backoff, and timeouts carry
//! the last refresh failure as context for diagnosis.

use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the connection broker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration: malformed instance name, no usable IP address,
    /// missing TLS material. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The control plane reported this instance cannot be used with the
    /// configured connection mode. Refresh scheduling stops on this error
    /// until the configuration changes.
    #[error("terminal error: {0}")]
    Terminal(String),

    /// A transient failure (network error, 5xx control-plane response).
    /// Retried with jittered backoff before being surfaced.
    #[error("transient error: {0}")]
    Transient(String),

    /// A caller's wait for a credential snapshot exceeded its budget.
    /// `last_failure` distinguishes "never succeeded" from "stale".
    #[error("unable to get valid instance data within {timeout:?}: {context}")]
    Timeout {
        /// The caller's wait budget.
        timeout: Duration,
        /// Description of the last refresh failure, or a note that no
        /// refresh has completed yet.
        context: String,
    },

    /// Certificate chain was cryptographically valid but the server identity
    /// did not match the expected instance. Always fatal for the attempt.
    #[error("trust error: {0}")]
    Trust(String),

    /// Malformed bytes on the metadata-exchange framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation on a cache or strategy that has been closed.
    #[error("{0}: named connection closed")]
    Closed(String),

    /// Underlying socket I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS stack failure (handshake, config assembly).
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
}

impl Error {
    /// Whether a retry wrapper may attempt this operation again.
    ///
    /// Only transient failures are retryable; everything else is fatal for
    /// the call that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Whether the refresh scheduler must stop scheduling further attempts.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Terminal(_) | Error::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transient("503".into()).is_retryable());
        assert!(!Error::Terminal("wrong generation".into()).is_retryable());
        assert!(!Error::Config("bad name".into()).is_retryable());
        assert!(!Error::Trust("cn mismatch".into()).is_retryable());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Error::Terminal("unsupported".into()).is_terminal());
        assert!(Error::Config("bad name".into()).is_terminal());
        assert!(!Error::Transient("flake".into()).is_terminal());
    }

    #[test]
    fn test_timeout_message_includes_context() {
        let err = Error::Timeout {
            timeout: Duration::from_millis(250),
            context: "last refresh attempt failed: transient error: 503".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("250ms"));
        assert!(msg.contains("503"));
    }
}
