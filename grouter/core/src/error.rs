//! Router Errors
//!
//! Error types shared across the routing pipeline. They follow the failure
//! taxonomy of the router:
//!
//! - [`RouterError`]: process-level failures (bad configuration, unusable
//!   listener) that stop the router
//! - [`SourceError`]: connection-level failures that end one source task
//! - [`BackendError`]: per-request or backend-connection failures, delivered
//!   to sources through a request's response channel
//! - [`QueueClosed`]: the routing queue has no peer left on the other side

use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;

/// The routing queue's other side is gone
#[derive(Clone, Copy, Debug, Default, Error, PartialEq, Eq)]
#[error("routing queue closed")]
pub struct QueueClosed;

/// Process-level router errors
#[derive(Debug, Error)]
pub enum RouterError {
    /// Source specification names a kind nobody registered
    #[error("unknown source kind: {0}")]
    UnknownSourceKind(String),

    /// Target specification names a kind nobody registered
    #[error("unknown target kind: {0}")]
    UnknownTargetKind(String),

    /// Network source specification lacks a `HOST:PORT` suffix
    #[error("missing listen HOST:PORT; instead, got: {0:?}")]
    MissingListenAddress(String),

    /// Remote target specification lacks a `HOST:PORT` suffix
    #[error("missing target HOST:PORT; instead, got: {0:?}")]
    MissingTargetAddress(String),

    /// Routing queue capacity must be at least one batch
    #[error("routing queue capacity must be at least 1")]
    InvalidQueueCapacity,

    /// A listener was handed to a source that serves no connections
    #[error("source {0:?} does not accept connections")]
    ListenerNotUsed(String),

    /// Listener could not be created
    #[error("could not listen on {addr}: {source}")]
    Bind {
        /// Address we tried to bind
        addr: String,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// The listener failed and no further connections can be accepted
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Routing queue closed underneath a producer or consumer
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),

    /// A source that runs on the dispatcher's own task failed
    #[error("source failed: {0}")]
    Source(#[source] SourceError),

    /// Operation interrupted by the shutdown token
    #[error("cancelled")]
    Cancelled,
}

impl From<SourceError> for RouterError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::QueueClosed(closed) => Self::QueueClosed(closed),
            other => Self::Source(other),
        }
    }
}

/// Connection-level errors that end a single source task
#[derive(Debug, Error)]
pub enum SourceError {
    /// Client stream I/O failed
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),

    /// Client sent something we cannot frame
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No target is draining the routing queue anymore
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

/// Errors produced while executing a request against a backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend stream I/O failed (dial, read, or write)
    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),

    /// Backend replied with something we cannot frame; the stream is out of sync
    #[error("backend protocol error: {0}")]
    Protocol(String),

    /// Backend rejected this one request
    #[error("backend error: {0}")]
    Request(String),

    /// Backend connection dropped before this request was executed
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The request was dropped without anyone answering it
    #[error("no response from target")]
    NoResponse,
}

impl BackendError {
    /// Whether the backend connection is unusable after this error
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lost_classification() {
        let io_err = BackendError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(io_err.is_connection_lost());
        assert!(BackendError::Protocol("garbage".into()).is_connection_lost());

        assert!(!BackendError::Request("out of memory".into()).is_connection_lost());
        assert!(!BackendError::Unavailable("reset".into()).is_connection_lost());
        assert!(!BackendError::NoResponse.is_connection_lost());
    }

    #[test]
    fn test_router_error_messages() {
        let err = RouterError::UnknownTargetKind("couchbase".into());
        assert_eq!(err.to_string(), "unknown target kind: couchbase");

        let err = RouterError::MissingListenAddress("11300".into());
        assert_eq!(
            err.to_string(),
            "missing listen HOST:PORT; instead, got: \"11300\""
        );

        let err: RouterError = QueueClosed.into();
        assert_eq!(err.to_string(), "routing queue closed");
    }
}
