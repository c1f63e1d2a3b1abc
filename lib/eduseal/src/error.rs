//! Eduseal Error Types
//!
//! Two families live here. [`ServiceError`] covers conditions that stop the
//! process from serving at all; [`RequestError`] covers everything that can
//! go wrong inside a single Seal or Validate transaction and is only ever
//! surfaced as the `error` field of a reply.

use thiserror::Error;

use crate::engine::EngineError;
use crate::hsm::HsmError;

/// Fatal startup errors.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HSM session initialization failed: {0}")]
    SessionInit(#[source] HsmError),

    #[error("Trust root error: {0}")]
    TrustRoots(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request-scoped failures. The `Display` output is the reply's error text.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("input is not valid base64, err: {0}")]
    InputDecode(#[from] base64::DecodeError),

    #[error("transaction_id is required")]
    MissingTransactionId,

    #[error("input pdf is not valid, err: {0}")]
    DocumentParse(EngineError),

    #[error("pkcs11 signer creation failed, err: {0}")]
    SignerConstruction(HsmError),

    #[error("input pdf is encrypted, err: {0}")]
    EncryptedDocument(String),

    #[error("signing failed, err: {0}")]
    SigningFailed(EngineError),

    #[error("no signature found")]
    SignatureNotFound,

    #[error("validation error: {0}")]
    SignatureValidation(EngineError),

    #[error("error getting transaction_id: {0}")]
    TransactionIdRecovery(EngineError),

    #[error("{0} is not enabled on this backend")]
    OperationDisabled(&'static str),

    #[error("pdf engine unavailable, err: {0}")]
    EngineUnavailable(EngineError),
}

impl RequestError {
    /// Classify an engine failure as `kind`, unless the engine was never
    /// reached at all.
    pub(crate) fn from_engine(error: EngineError, kind: fn(EngineError) -> Self) -> Self {
        match error {
            EngineError::Transport(_) => RequestError::EngineUnavailable(error),
            other => kind(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_not_found_display() {
        assert_eq!(
            RequestError::SignatureNotFound.to_string(),
            "no signature found"
        );
    }

    #[test]
    fn test_encrypted_document_display() {
        let err = RequestError::EncryptedDocument("no decryption key".to_string());
        assert_eq!(
            err.to_string(),
            "input pdf is encrypted, err: no decryption key"
        );
    }

    #[test]
    fn test_encrypted_and_generic_signing_messages_differ() {
        let encrypted = RequestError::EncryptedDocument("x".to_string()).to_string();
        let generic = RequestError::SigningFailed(EngineError::Signing("x".to_string())).to_string();
        assert_ne!(encrypted, generic);
        assert!(generic.starts_with("signing failed"));
    }

    #[test]
    fn test_operation_disabled_display() {
        let err = RequestError::OperationDisabled("seal");
        assert_eq!(err.to_string(), "seal is not enabled on this backend");
    }

    #[test]
    fn test_unreachable_engine_is_not_a_parse_error() {
        let err = RequestError::from_engine(
            EngineError::Transport("connection refused".to_string()),
            RequestError::DocumentParse,
        );
        assert!(matches!(err, RequestError::EngineUnavailable(_)));
        assert!(err.to_string().starts_with("pdf engine unavailable"));

        let err = RequestError::from_engine(
            EngineError::Parse("no header".to_string()),
            RequestError::DocumentParse,
        );
        assert!(err.to_string().starts_with("input pdf is not valid"));
    }

    #[test]
    fn test_session_init_display() {
        let err = ServiceError::SessionInit(HsmError::NoSlotAvailable);
        assert_eq!(
            err.to_string(),
            "HSM session initialization failed: No slot available"
        );
    }
}
