//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Protocol(#[from] devrelay_protocol::ProtocolError),

    #[error("broker error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("connection idle for more than {0:?}")]
    IdleTimeout(std::time::Duration),
}

/// Errors surfaced by a single publish attempt.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("AMQP publish failed: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("publish port closed")]
    PortClosed,

    #[error("publish rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use devrelay_protocol::ProtocolError;

    #[test]
    fn test_error_display() {
        let err = ServerError::from(ProtocolError::UnexpectedEof { buffered: 4 });
        assert!(err.to_string().starts_with("decode error"));

        let err = ServerError::from(ConfigError::ValidationError("bad".into()));
        assert!(err.to_string().starts_with("configuration error"));

        let err = PublishError::Rejected("nope".into());
        assert_eq!(err.to_string(), "publish rejected: nope");

        let err = ServerError::IdleTimeout(std::time::Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }
}
