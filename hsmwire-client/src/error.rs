//! Client error types.

use crate::config::ConfigError;
use hsmwire_deadline::DeadlineError;
use hsmwire_protocol::{HsmError, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect timeout")]
    Timeout,

    #[error("request timeout: {0}")]
    Deadline(#[from] DeadlineError),

    #[error("{0}")]
    Hsm(#[from] HsmError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Deadline(e) => e.is_retryable(),
            ClientError::Hsm(e) => e.retryable,
            _ => false,
        }
    }

    /// Returns the HSM status code, if this is an HSM error status.
    pub fn hsm_code(&self) -> Option<&str> {
        match self {
            ClientError::Hsm(e) => Some(&e.code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsmwire_protocol::Fields;
    use std::time::Duration;

    #[test]
    fn test_retryable() {
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(ClientError::Deadline(DeadlineError::timeout(Duration::from_secs(1))).is_retryable());
        assert!(!ClientError::NotConnected.is_retryable());
        assert!(!ClientError::UnexpectedReply("x".into()).is_retryable());

        let hsm = HsmError {
            code: "15".into(),
            method: "generate_key".into(),
            key: "15".into(),
            name: "INVALID_INPUT".into(),
            message: "Error in input data".into(),
            retryable: false,
            fields: Fields::new(),
        };
        let err = ClientError::from(hsm);
        assert!(!err.is_retryable());
        assert_eq!(err.hsm_code(), Some("15"));
        assert!(err.to_string().contains("INVALID_INPUT"));
    }
}
