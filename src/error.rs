//! Crate-wide error taxonomy.
//!
//! # Responsibilities
//! - Classify every failure surfaced to callers
//! - Keep channel-open failures distinct from connection-fatal ones
//! - Guarantee pending futures resolve with a terminal error, never dangle

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by connection, channel and identity operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted on, or interrupted by, a closed connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The remote endpoint has no handler for the requested service.
    /// The connection itself remains usable.
    #[error("no remote service registered for \"{service}\"")]
    ServiceNotFound { service: String },

    /// The multiplexer's concurrent-channel quota is exhausted.
    /// The connection itself remains usable.
    #[error("channel limit exceeded: {limit} channels already open")]
    ChannelLimitExceeded { limit: usize },

    /// Identity resolution failed at the credential layer.
    /// Fatal to the connection only during the initial handshake.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Caller lacks the capability guarding the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    /// Anonymous access has been administratively disabled.
    #[error("anonymous access is disabled on this endpoint")]
    AnonymousDisabled,

    /// API misuse detected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A channel open was cancelled before the peer responded.
    #[error("channel open cancelled")]
    Cancelled,

    /// An operation exceeded its configured deadline.
    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Failure reported by the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error terminates the connection it occurred on.
    ///
    /// Channel-open failures and lazy authentication failures leave the
    /// connection usable; only close and transport failures are terminal.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_failures_are_not_fatal() {
        assert!(!Error::ServiceNotFound {
            service: "echo".into()
        }
        .is_connection_fatal());
        assert!(!Error::ChannelLimitExceeded { limit: 8 }.is_connection_fatal());
        assert!(Error::ConnectionClosed.is_connection_fatal());
    }

    #[test]
    fn timeout_display_includes_millis() {
        let e = Error::Timeout {
            operation: "open_channel",
            timeout: Duration::from_millis(1500),
        };
        assert!(e.to_string().contains("1500ms"));
    }
}
