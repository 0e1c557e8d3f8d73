#![forbid(unsafe_code)]

//! Error taxonomy shared by the gateway components.
//!
//! `ClientError` is what the network seam reports; `GatewayError` is what the
//! components above it surface to the HTTP layer.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`crate::client::NetworkClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The publisher is private, banned, or does not exist.
    #[error("channel {0} is private or does not exist")]
    ChannelPrivate(String),

    /// The account has two-step verification enabled.
    #[error("two-step verification password required")]
    PasswordRequired,

    /// The session is not signed in.
    #[error("client is not authorized")]
    Unauthorized,

    /// The remote side answered with an error.
    #[error("request failed: {0}")]
    Request(String),

    /// The transport itself failed (connection refused, reset, malformed body).
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad or missing request parameter.
    #[error("{0}")]
    Validation(String),

    /// The network is unreachable or the session is not authorized.
    #[error("external network unavailable: {0}")]
    ExternalUnavailable(String),

    /// One publisher could not be queried. Never escapes a fan-out branch.
    #[error("publisher {publisher} unreachable: {reason}")]
    PublisherUnreachable { publisher: String, reason: String },

    /// The requested resource cannot be resolved.
    #[error("{0}")]
    NotFound(String),

    /// An operation exceeded its wall-clock bound.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The single-context executor is gone (shutdown or panic).
    #[error("network executor is not running")]
    ExecutorStopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Io(err) => GatewayError::Io(err),
            other => GatewayError::ExternalUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_external_unavailable() {
        let err: GatewayError = ClientError::Unauthorized.into();
        assert!(matches!(err, GatewayError::ExternalUnavailable(_)));
        assert!(err.to_string().contains("not authorized"));
    }

    #[test]
    fn timeout_message_mentions_duration() {
        let err = GatewayError::Timeout {
            duration: Duration::from_secs(45),
        };
        assert_eq!(err.to_string(), "operation timed out after 45s");
    }
}
