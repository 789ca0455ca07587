//! Server lifecycle errors

use thiserror::Error;
use tower::BoxError;

/// Failure of one server task; any of these makes the run unsuccessful
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {endpoint} endpoint on {addr}: {source}")]
    Bind {
        endpoint: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service registration failed: {0}")]
    Register(#[source] BoxError),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("auxiliary endpoint failed: {0}")]
    Auxiliary(#[source] BoxError),

    #[error("server task {task} did not complete: {reason}")]
    Task { task: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_names_endpoint_and_address() {
        let err = ServerError::Bind {
            endpoint: "health",
            addr: "localhost:9000".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        let message = err.to_string();
        assert!(message.contains("health"));
        assert!(message.contains("localhost:9000"));
    }

    #[test]
    fn register_error_keeps_cause() {
        let err = ServerError::Register("backend orders unreachable".into());
        assert_eq!(
            err.to_string(),
            "service registration failed: backend orders unreachable"
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
