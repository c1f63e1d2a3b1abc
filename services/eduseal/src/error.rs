//! Transport adapter errors

use eduseal::ServiceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Malformed message: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== TransportError Display Tests ====================

    #[test]
    fn test_transport_error_config_display() {
        let err = TransportError::Config("TRANSPORT must be one of rpc, stream".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: TRANSPORT must be one of rpc, stream"
        );
    }

    #[test]
    fn test_transport_error_redis_display() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::IoError, "connection refused"));
        let err = TransportError::from(redis_err);
        assert!(err.to_string().starts_with("Redis error:"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_transport_error_wraps_service_error() {
        let err = TransportError::from(ServiceError::TrustRoots("no such dir".to_string()));
        assert_eq!(
            err.to_string(),
            "Service error: Trust root error: no such dir"
        );
    }
}
