//! Unified error handling for lacecast.
//!
//! Protocol anomalies (corrupt datagrams, unknown message types, stale mutex
//! traffic) never surface here: they are logged and dropped where they are
//! found. [`NodeError`] covers what an application calling the
//! [`Broadcaster`](crate::Broadcaster) can act on.

use crate::config::ConfigError;
use crate::transport::TransportError;
use lace_proto::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results returned by node operations.
pub type Result<T, E = NodeError> = std::result::Result<T, E>;

/// Errors returned by node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("node is not a lace member")]
    NotJoined,

    #[error("node is already a lace member")]
    AlreadyJoined,

    #[error("no bootstrap addresses given")]
    NoBootstrap,

    #[error("node has no peers")]
    NoPeers,

    #[error("mutex already requested or held")]
    MutexBusy,

    #[error("mutex not held")]
    MutexNotHeld,

    #[error("mutex not acquired within {0:?}")]
    MutexTimeout(Duration),

    /// The acquisition was abandoned before the lock was granted (release or
    /// a lace reconnect dropped it).
    #[error("mutex acquisition cancelled")]
    MutexCancelled,

    #[error("node already started")]
    AlreadyStarted,

    #[error("node stopped")]
    Stopped,
}

impl NodeError {
    /// Get a static error code string for log fields.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Config(_) => "config",
            Self::NotJoined => "not_joined",
            Self::AlreadyJoined => "already_joined",
            Self::NoBootstrap => "no_bootstrap",
            Self::NoPeers => "no_peers",
            Self::MutexBusy => "mutex_busy",
            Self::MutexNotHeld => "mutex_not_held",
            Self::MutexTimeout(_) => "mutex_timeout",
            Self::MutexCancelled => "mutex_cancelled",
            Self::AlreadyStarted => "already_started",
            Self::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(NodeError::NotJoined.error_code(), "not_joined");
        assert_eq!(NodeError::MutexBusy.error_code(), "mutex_busy");
        assert_eq!(
            NodeError::MutexTimeout(Duration::from_secs(1)).error_code(),
            "mutex_timeout"
        );
    }

    #[test]
    fn test_from_transport() {
        let err: NodeError = TransportError::Closed.into();
        assert_eq!(err.error_code(), "transport");
        assert!(err.to_string().contains("closed"));
    }
}
