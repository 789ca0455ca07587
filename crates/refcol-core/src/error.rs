//! Common error types for reflection backends

use thiserror::Error;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur while talking to a reflection backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// Backend address could not be parsed
    #[error("Invalid backend address {address:?}: {reason}")]
    InvalidAddress {
        /// The address as configured
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// Physical connection could not be established
    #[error("Failed to connect to {target}: {reason}")]
    Connect {
        /// `host[:port]` that was dialed
        target: String,
        /// Underlying transport message
        reason: String,
    },

    /// TLS client setup failed
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Transport/communication error on an established connection
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::Status),

    /// Timeout waiting for the backend
    #[error("Backend call timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_address() {
        let err = BackendError::InvalidAddress {
            address: "http://x".to_string(),
            reason: "unsupported scheme".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid backend address \"http://x\": unsupported scheme"
        );
    }

    #[test]
    fn status_converts_to_transport() {
        let err: BackendError = tonic::Status::unavailable("down").into();
        assert!(matches!(err, BackendError::Transport(_)));
        assert!(err.to_string().contains("down"));
    }
}
